#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod error;
pub mod message;
pub mod util;

pub use message::{Message, MessageObserver, MessageType, Reliability, ReliabilityType};
