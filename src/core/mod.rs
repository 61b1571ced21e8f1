pub mod params;
pub mod ring_buffer;
pub mod types;
