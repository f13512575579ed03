pub mod braille;
pub mod models;
pub mod settings;
