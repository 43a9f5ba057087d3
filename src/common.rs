pub mod error;

pub mod latch;

pub mod relatch;

pub mod statistics;
