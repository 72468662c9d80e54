#![allow(dead_code)]

pub mod descriptors;
pub mod fakes;
pub mod images;
