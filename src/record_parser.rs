
use crate::data_types::records::{HaplosetRecord, ReadAssignment, VariantSupportRecord};

use flate2::bufread::MultiGzDecoder;
use log::{debug, trace, warn};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Consensus value used by floria when a locus has no genotype call
const NO_CALL_CONSENSUS: &str = "?";

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("required input file does not exist: {path:?}")]
    MissingInput { path: PathBuf },
    #[error("error while reading {path:?}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("error while parsing {path:?}: {source}")]
    Csv { path: PathBuf, #[source] source: csv::Error },
    #[error("no contigs found in {path:?}")]
    NoContigs { path: PathBuf }
}

/// One row of the floria contig ploidy summary, only the columns we need are kept
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ContigPloidy {
    /// the contig name
    pub contig: String,
    /// average number of strains on the contig, counting haplosets with HAPQ >= 15
    #[serde(rename = "average_straincount_min15hapq")]
    pub average_strain_count: f64
}

/// Opens a plain-text or gzipped (by `.gz` extension) file for buffered reading.
/// # Arguments
/// * `filename` - the file to open
/// # Errors
/// * `ParseError::MissingInput` if the file does not exist
/// * `ParseError::Io` if the file cannot be opened
pub fn open_text_file(filename: &Path) -> Result<Box<dyn BufRead + Send>, ParseError> {
    if !filename.exists() {
        return Err(ParseError::MissingInput { path: filename.to_path_buf() });
    }
    let file: File = File::open(filename)
        .map_err(|source| ParseError::Io { path: filename.to_path_buf(), source })?;
    let file_reader = BufReader::new(file);
    if filename.extension().unwrap_or_default() == "gz" {
        debug!("Detected gzip extension, loading {:?} with MultiGzDecoder...", filename);
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file_reader))))
    } else {
        Ok(Box::new(file_reader))
    }
}

/// Parses the fields of a haploset header line (without the leading '>').
/// Field 0 is `<haploset>.<suffix>`, field 1 is `contig:<name>`, and field 6 is `HAPQ:<int>`.
/// Returns None if any of those fields are missing or malformed.
fn parse_haploset_header(header: &str) -> Option<HaplosetRecord> {
    let fields: Vec<&str> = header.trim_end().split('\t').collect();
    let haploset: &str = fields.first()?.split('.').next()?;
    let contig: &str = fields.get(1)?.split(':').nth(1)?;
    let hapq: u32 = fields.get(6)?.split(':').nth(1)?.trim().parse().ok()?;
    if haploset.is_empty() || contig.is_empty() {
        return None;
    }
    Some(HaplosetRecord {
        contig: contig.to_string(),
        haploset: haploset.to_string(),
        hapq
    })
}

/// Parses a floria haploset listing, collecting the haploset headers and the reads of every confident haploset.
/// Reads are listed one per line after their haploset header; only the first tab-delimited field is used.
/// # Arguments
/// * `reader` - the haploset listing
/// * `hapq_cut` - reads are only kept for haplosets with HAPQ >= this value
/// # Errors
/// * if the underlying reader fails
pub fn read_haplosets<R: BufRead>(reader: R, hapq_cut: u32) -> std::io::Result<(Vec<HaplosetRecord>, ReadAssignment)> {
    let mut haplosets: Vec<HaplosetRecord> = vec![];
    let mut read_assignment: ReadAssignment = ReadAssignment::new();

    // the haploset that reads currently belong to, None if it failed the cutoff or was malformed
    let mut current: Option<(String, String)> = None;
    for (line_index, line_result) in reader.lines().enumerate() {
        let line: String = line_result?;
        if let Some(header) = line.strip_prefix('>') {
            match parse_haploset_header(header) {
                Some(record) => {
                    read_assignment.add_contig(&record.contig);
                    current = if record.hapq >= hapq_cut {
                        Some((record.contig.clone(), record.haploset.clone()))
                    } else {
                        trace!("Ignoring reads of {} on {}, HAPQ {} < {}", record.haploset, record.contig, record.hapq, hapq_cut);
                        None
                    };
                    haplosets.push(record);
                },
                None => {
                    warn!("Skipping malformed haploset header on line {}: {:?}", line_index + 1, line);
                    current = None;
                }
            };
        } else if let Some((contig, haploset)) = current.as_ref() {
            let read_name: &str = line.split('\t').next().unwrap_or_default().trim();
            if !read_name.is_empty() {
                read_assignment.insert(contig, read_name.to_string(), haploset.clone());
            }
        }
    }
    Ok((haplosets, read_assignment))
}

/// Loads a `<contig>.haplosets` file, see `read_haplosets(...)`.
/// # Errors
/// * if the file is missing or cannot be read
pub fn parse_haplosets(filename: &Path, hapq_cut: u32) -> Result<(Vec<HaplosetRecord>, ReadAssignment), ParseError> {
    let reader = open_text_file(filename)?;
    let (haplosets, read_assignment) = read_haplosets(reader, hapq_cut)
        .map_err(|source| ParseError::Io { path: filename.to_path_buf(), source })?;
    debug!("Loaded {} haplosets and {} reads from {:?}", haplosets.len(), read_assignment.num_reads(), filename);
    Ok((haplosets, read_assignment))
}

/// Parses a floria vartig listing; this shares the header format with haploset listings, but the body lines are allele strings that we ignore.
/// # Errors
/// * if the underlying reader fails
pub fn read_vartigs<R: BufRead>(reader: R) -> std::io::Result<Vec<HaplosetRecord>> {
    let mut haplosets: Vec<HaplosetRecord> = vec![];
    for (line_index, line_result) in reader.lines().enumerate() {
        let line: String = line_result?;
        if let Some(header) = line.strip_prefix('>') {
            match parse_haploset_header(header) {
                Some(record) => haplosets.push(record),
                None => warn!("Skipping malformed vartig header on line {}: {:?}", line_index + 1, line)
            };
        }
    }
    Ok(haplosets)
}

/// Loads a `<contig>.vartigs` file, see `read_vartigs(...)`.
/// # Errors
/// * if the file is missing or cannot be read
pub fn parse_vartigs(filename: &Path) -> Result<Vec<HaplosetRecord>, ParseError> {
    let reader = open_text_file(filename)?;
    let haplosets = read_vartigs(reader)
        .map_err(|source| ParseError::Io { path: filename.to_path_buf(), source })?;
    debug!("Loaded {} vartig headers from {:?}", haplosets.len(), filename);
    Ok(haplosets)
}

/// Parses one locus line of a vartig info block.
/// Format is `pos:<int>\t<cons>\t<allele>:<support>|<allele>:<support>|...`.
/// Returns `Ok(None)` for a locus without a consensus call, and `Err(())` if anything fails to parse.
fn parse_locus_line(line: &str, contig: &str, haploset: &str) -> Result<Option<Vec<VariantSupportRecord>>, ()> {
    let fields: Vec<&str> = line.trim_end().split('\t').collect();
    if fields.len() < 3 {
        return Err(());
    }
    let pos: u64 = fields[0].split(':').nth(1)
        .ok_or(())?
        .trim()
        .parse().map_err(|_| ())?;
    let cons_field: &str = fields[1].trim();
    if cons_field == NO_CALL_CONSENSUS {
        return Ok(None);
    }
    let cons: u32 = cons_field.parse().map_err(|_| ())?;

    let mut records: Vec<VariantSupportRecord> = vec![];
    for allele_support in fields[2].split('|') {
        let (allele, support) = allele_support.split_once(':').ok_or(())?;
        records.push(VariantSupportRecord {
            contig: contig.to_string(),
            haploset: haploset.to_string(),
            pos,
            cons,
            allele: allele.trim().parse().map_err(|_| ())?,
            support: support.trim().parse().map_err(|_| ())?
        });
    }
    Ok(Some(records))
}

/// Parses a floria `vartig_info.txt` into one record per (haploset, locus, allele).
/// Headers are `><haploset>.<suffix>/<contig>`; loci without a consensus call and malformed lines are skipped.
/// # Errors
/// * if the underlying reader fails
pub fn read_vartig_info<R: BufRead>(reader: R) -> std::io::Result<Vec<VariantSupportRecord>> {
    let mut records: Vec<VariantSupportRecord> = vec![];
    let mut current: Option<(String, String)> = None;
    let mut skipped_lines: usize = 0;
    for (line_index, line_result) in reader.lines().enumerate() {
        let line: String = line_result?;
        if let Some(header) = line.strip_prefix('>') {
            let label: &str = header.trim_end().split('\t').next().unwrap_or_default();
            let haploset: &str = label.split('.').next().unwrap_or_default();
            let contig: &str = label.rsplit('/').next().unwrap_or_default();
            current = if haploset.is_empty() || contig.is_empty() {
                warn!("Skipping malformed vartig info header on line {}: {:?}", line_index + 1, line);
                None
            } else {
                Some((contig.to_string(), haploset.to_string()))
            };
            continue;
        }

        if line.trim().is_empty() {
            continue;
        }

        let (contig, haploset) = match current.as_ref() {
            Some(c) => c,
            None => {
                trace!("Skipping line {} without a valid header", line_index + 1);
                skipped_lines += 1;
                continue;
            }
        };

        match parse_locus_line(&line, contig, haploset) {
            Ok(Some(mut locus_records)) => records.append(&mut locus_records),
            Ok(None) => {},
            Err(()) => {
                trace!("Skipping malformed locus on line {}: {:?}", line_index + 1, line);
                skipped_lines += 1;
            }
        };
    }

    if skipped_lines > 0 {
        debug!("Skipped {} malformed vartig info lines", skipped_lines);
    }
    Ok(records)
}

/// Loads a `vartig_info.txt` file, see `read_vartig_info(...)`.
/// # Errors
/// * if the file is missing or cannot be read
pub fn parse_vartig_info(filename: &Path) -> Result<Vec<VariantSupportRecord>, ParseError> {
    let reader = open_text_file(filename)?;
    let records = read_vartig_info(reader)
        .map_err(|source| ParseError::Io { path: filename.to_path_buf(), source })?;
    debug!("Loaded {} allele support records from {:?}", records.len(), filename);
    Ok(records)
}

/// Loads the floria `contig_ploidy_info.tsv` summary.
/// # Errors
/// * if the file is missing or a row is missing the required columns
pub fn parse_contig_ploidy(filename: &Path) -> Result<Vec<ContigPloidy>, ParseError> {
    let reader = open_text_file(filename)?;
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let mut rows: Vec<ContigPloidy> = vec![];
    for row_result in csv_reader.deserialize() {
        let row: ContigPloidy = row_result
            .map_err(|source| ParseError::Csv { path: filename.to_path_buf(), source })?;
        rows.push(row);
    }
    debug!("Loaded {} contig ploidy rows from {:?}", rows.len(), filename);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HAPLOSETS: &str = ">HAP0.NZ_CP081897.1\tcontig:NZ_CP081897.1\tSTART:770\tEND:5000\tCOV:40.1\tERR:0.01\tHAPQ:16\tREL_ERR:1.1
read_a
read_b\textra
>HAP1.NZ_CP081897.1\tcontig:NZ_CP081897.1\tSTART:770\tEND:5000\tCOV:12.5\tERR:0.02\tHAPQ:4\tREL_ERR:1.3
read_c
>HAP2.NZ_CP081897.1\tcontig:NZ_CP081897.1\tSTART:770
read_d
>HAP3.NZ_CP081897.1\tcontig:NZ_CP081897.1\tSTART:6000\tEND:9000\tCOV:30.0\tERR:0.01\tHAPQ:15\tREL_ERR:1.0
read_e
";

    const VARTIG_INFO: &str = ">HAP0.NZ_CP081897.1/NZ_CP081897.1\tSNPRANGE:1-3
pos:770\t0\t0:35|1:2
pos:1022\t1\t1:9|0:4
pos:1500\t?\t0:3|1:3
pos:not_a_number\t0\t0:1
pos:2034\t0\t0:oops
>HAP1.NZ_CP081897.1/NZ_CP081897.1\tSNPRANGE:1-2

pos:770\t1\t1:20
pos:2034\t0\t0:7|1:1
";

    #[test]
    fn test_read_haplosets() {
        let (haplosets, read_assignment) = read_haplosets(HAPLOSETS.as_bytes(), 15).unwrap();

        // the malformed HAP2 header is skipped, the rest are kept regardless of HAPQ
        assert_eq!(haplosets, vec![
            HaplosetRecord { contig: "NZ_CP081897.1".to_string(), haploset: "HAP0".to_string(), hapq: 16 },
            HaplosetRecord { contig: "NZ_CP081897.1".to_string(), haploset: "HAP1".to_string(), hapq: 4 },
            HaplosetRecord { contig: "NZ_CP081897.1".to_string(), haploset: "HAP3".to_string(), hapq: 15 }
        ]);

        // HAP0 passes the cutoff, HAP1 does not, and HAP3 is exactly at the cutoff
        assert_eq!(read_assignment.haploset("NZ_CP081897.1", "read_a"), Some("HAP0"));
        assert_eq!(read_assignment.haploset("NZ_CP081897.1", "read_b"), Some("HAP0"));
        assert_eq!(read_assignment.haploset("NZ_CP081897.1", "read_c"), None);
        assert_eq!(read_assignment.haploset("NZ_CP081897.1", "read_d"), None);
        assert_eq!(read_assignment.haploset("NZ_CP081897.1", "read_e"), Some("HAP3"));
        assert_eq!(read_assignment.num_reads(), 3);
    }

    #[test]
    fn test_read_vartigs() {
        let vartigs = "\
>HAP0.NZ_CP081897.1\tcontig:NZ_CP081897.1\tSTART:770\tEND:5000\tCOV:40.1\tERR:0.01\tHAPQ:16\tREL_ERR:1.1
0101??10
>HAP1.NZ_CP081897.1\tcontig:NZ_CP081897.1\tSTART:770\tEND:5000\tCOV:12.5\tERR:0.02\tHAPQ:4\tREL_ERR:1.3
1010??01
";
        let haplosets = read_vartigs(vartigs.as_bytes()).unwrap();
        assert_eq!(haplosets.len(), 2);
        assert_eq!(haplosets[0].contig, "NZ_CP081897.1");
        assert_eq!(haplosets[0].haploset, "HAP0");
        assert_eq!(haplosets[0].hapq, 16);
        assert_eq!(haplosets[1].hapq, 4);
    }

    #[test]
    fn test_read_vartig_info() {
        let records = read_vartig_info(VARTIG_INFO.as_bytes()).unwrap();
        let summary: Vec<(&str, &str, u64, u32, u32, u64)> = records.iter()
            .map(|r| (r.contig.as_str(), r.haploset.as_str(), r.pos, r.cons, r.allele, r.support))
            .collect();

        // no-call locus at 1500 and both malformed lines are skipped entirely
        assert_eq!(summary, vec![
            ("NZ_CP081897.1", "HAP0", 770, 0, 0, 35),
            ("NZ_CP081897.1", "HAP0", 770, 0, 1, 2),
            ("NZ_CP081897.1", "HAP0", 1022, 1, 1, 9),
            ("NZ_CP081897.1", "HAP0", 1022, 1, 0, 4),
            ("NZ_CP081897.1", "HAP1", 770, 1, 1, 20),
            ("NZ_CP081897.1", "HAP1", 2034, 0, 0, 7),
            ("NZ_CP081897.1", "HAP1", 2034, 0, 1, 1)
        ]);
    }

    #[test]
    fn test_locus_before_header() {
        let records = read_vartig_info("pos:770\t0\t0:35\n".as_bytes()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_missing_file() {
        let result = parse_vartig_info(Path::new("./test_data/does_not_exist.txt"));
        assert!(matches!(result, Err(ParseError::MissingInput { .. })));
    }

    #[test]
    fn test_parse_files() {
        let haplosets_fn = PathBuf::from("./test_data/floria_out/contig_1/contig_1.haplosets");
        let (haplosets, read_assignment) = parse_haplosets(&haplosets_fn, 15).unwrap();
        assert_eq!(haplosets.len(), 5);
        assert_eq!(read_assignment.haploset("contig_1", "c1_read_0"), Some("HAP0"));
        // HAP2 is below the cutoff
        assert_eq!(read_assignment.haploset("contig_1", "c1_read_6"), None);
        assert_eq!(read_assignment.num_reads(), 8);

        // gzip and plain text should be identical
        let plain = parse_vartig_info(&PathBuf::from("./test_data/floria_out/contig_1/vartig_info.txt")).unwrap();
        let gzipped = parse_vartig_info(&PathBuf::from("./test_data/vartig_info_contig_1.txt.gz")).unwrap();
        assert!(!plain.is_empty());
        assert_eq!(plain, gzipped);
    }

    #[test]
    fn test_parse_contig_ploidy() {
        let rows = parse_contig_ploidy(&PathBuf::from("./test_data/floria_out/contig_ploidy_info.tsv")).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].contig, "contig_1");
        assert_eq!(rows[1].contig, "contig_2");
        assert_eq!(rows[0].average_strain_count, 1.5);
        assert_eq!(rows[1].average_strain_count, 2.5);
    }

    #[test]
    fn test_parse_contig_ploidy_missing_column() {
        let result = parse_contig_ploidy(&PathBuf::from("./test_data/bad_contig_ploidy_info.tsv"));
        assert!(matches!(result, Err(ParseError::Csv { .. })));
    }
}
