pub mod exotel;
pub mod smartflo;
