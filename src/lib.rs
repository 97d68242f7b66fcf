// emberc — compiles neural-network compute graphs into NVM images for
// intermittently-powered MCUs.

pub mod codegen;
pub mod config;
pub mod flags;
pub mod graph;
pub mod normalize;
pub mod nvm_format;
pub mod quantize;
pub mod tiling;
