pub mod access;
pub mod decision;
