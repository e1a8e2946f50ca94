pub mod console;
pub mod elasticsearch;
