#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod description;
pub mod role;

pub use description::Description;
pub use role::Role;
