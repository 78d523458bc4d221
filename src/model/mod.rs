pub mod biencoder;
pub mod crossencoder;
pub mod dropout;
pub(crate) mod embeddings;
pub(crate) mod encoder;
pub(crate) mod layers;
pub(crate) mod text_encoder;
pub mod tokenization;
