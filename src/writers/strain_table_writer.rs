
use serde::Serialize;
use std::fs::File;
use std::path::Path;

use crate::data_types::strain_map::StrainMap;

/// Writes the haploset to strain assignments as a delimited table
pub struct StrainTableWriter {
    /// Handle for the CSV writer
    csv_writer: csv::Writer<File>
}

/// Contains all the data written to each row of the strain table
#[derive(Serialize)]
struct StrainRow<'a> {
    /// the contig the haploset is on
    contig: &'a str,
    /// the haploset identifier
    haploset: &'a str,
    /// the strain assigned to the haploset
    strain: usize
}

impl StrainTableWriter {
    /// Creates a new writer for a given filename
    /// # Arguments
    /// * `filename` - the path to write the table to
    pub fn new(filename: &Path) -> csv::Result<StrainTableWriter> {
        // modify the delimiter to "," if it ends with .csv
        let is_csv: bool = filename.extension().unwrap_or_default() == "csv";
        let delimiter: u8 = if is_csv { b',' } else { b'\t' };
        let csv_writer: csv::Writer<File> = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_path(filename)?;
        Ok(StrainTableWriter {
            csv_writer
        })
    }

    /// Writes every assignment in the map, sorted by contig and then haploset.
    /// # Arguments
    /// * `strain_map` - the final strain assignments
    /// # Errors
    /// * if the csv_writer has any errors
    pub fn write_strain_map(&mut self, strain_map: &StrainMap) -> Result<(), Box<dyn std::error::Error>> {
        for (contig, haploset, strain) in strain_map.sorted_entries() {
            let row: StrainRow = StrainRow {
                contig,
                haploset,
                strain
            };
            self.csv_writer.serialize(&row)?;
        }
        self.csv_writer.flush()?;
        Ok(())
    }
}
