
/// Contains the alignment annotator and its htslib implementation
pub mod strain_bam_writer;
/// Contains the writer for the haploset to strain table
pub mod strain_table_writer;
