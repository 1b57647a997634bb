pub mod tgi;

pub use tgi::Tgi;
