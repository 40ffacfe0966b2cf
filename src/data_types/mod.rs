
/// Contains the parsed floria records and the read assignment lookup
pub mod records;
/// Contains the haploset to strain lookup
pub mod strain_map;
