pub mod status;

pub use status::render;
