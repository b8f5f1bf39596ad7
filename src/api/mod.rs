pub mod device;
pub mod rest;
