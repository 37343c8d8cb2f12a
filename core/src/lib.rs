pub mod config;
pub mod emulator;
pub mod error;
pub mod fcode;
pub mod filesystem;
pub mod hostadapter;
pub mod picom;
pub mod types;

#[cfg(test)]
pub mod test;
