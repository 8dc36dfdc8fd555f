pub mod machine;
pub mod oee;
pub mod sample;
pub mod segment;
pub mod snapshot;
pub mod stats;
pub mod window;
