pub mod sos;
pub mod status;
