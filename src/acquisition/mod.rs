pub mod bald;
pub mod ragged;
pub mod sampling;

#[cfg(test)]
mod tests;
