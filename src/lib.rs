
/// CLI functionality and checks
pub mod cli;
/// Gaussian mixture clustering of allele frequencies, including automatic component selection
pub mod cluster_engine;
/// Contains the record types shared across the pipeline
pub mod data_types;
/// Allele frequency computation across confident haplosets
pub mod featurizer;
/// Line parsers for the floria output files
pub mod record_parser;
/// Collapses per-observation cluster labels into one strain per haploset
pub mod strain_reconciler;
/// Organizes the full strain inference workflow from a floria output folder
pub mod strainer;
/// Loads and joins all per-contig floria tables
pub mod table_assembler;
/// Contains all the various output writer functionality
pub mod writers;
