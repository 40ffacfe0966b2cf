
use crate::data_types::records::ReadAssignment;
use crate::data_types::strain_map::StrainMap;

use log::{debug, info, warn};
use rust_htslib::bam;
use rust_htslib::bam::Read;
use std::borrow::Cow;
use std::error::Error;
use std::path::{Path, PathBuf};

/// Tag holding the haploset a read was phased into
pub const HAPLOSET_TAG: &[u8] = b"HP";
/// Tag holding the strain a read was assigned to
pub const STRAIN_TAG: &[u8] = b"ST";

/// How annotated alignments are written
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OutputMode {
    /// every record goes to one file, with haploset and strain tags added where known
    #[default]
    Tag,
    /// one file per strain
    Split
}

/// An alignment record that we can read a name from and write tags to
pub trait TaggableRecord {
    /// the read name
    fn query_name(&self) -> Cow<'_, str>;
    /// Sets a string tag, replacing any existing value
    fn set_string_tag(&mut self, tag: &[u8], value: &str) -> Result<(), Box<dyn Error>>;
    /// Sets an integer tag, replacing any existing value
    fn set_integer_tag(&mut self, tag: &[u8], value: i32) -> Result<(), Box<dyn Error>>;
}

/// Destination for alignment records; anything buffered is flushed when the sink is dropped
pub trait AlignmentSink<R> {
    fn write_record(&mut self, record: &R) -> Result<(), Box<dyn Error>>;
}

/// A stream of alignment records that can be read more than once.
pub trait AlignmentSource {
    type Record: TaggableRecord;
    type Sink: AlignmentSink<Self::Record>;

    /// Restarts the stream from the first record
    fn rewind(&mut self) -> Result<(), Box<dyn Error>>;
    /// Returns the next record, or None at the end of the stream
    fn read_next(&mut self) -> Option<Result<Self::Record, Box<dyn Error>>>;
    /// The reference name a record is mapped to, None if unmapped
    fn reference_name<'a>(&'a self, record: &'a Self::Record) -> Option<&'a str>;
    /// Opens an output that uses this stream as the template
    fn create_sink(&self, filename: &Path) -> Result<Self::Sink, Box<dyn Error>>;
}

/// What we know about a single record after looking it up
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordResolution<'a> {
    /// the reference has no read assignments, or the read is not in them
    NoHaploset,
    /// the read belongs to a haploset, which may or may not have a strain
    Haploset { haploset: &'a str, strain: Option<usize> }
}

/// Looks up the haploset and strain for a read.
/// Both lookups are optional, a miss on either is never an error.
/// # Arguments
/// * `reference_name` - the reference the read is mapped to, if any
/// * `query_name` - the read name
/// * `read_assignment` - read to haploset assignments
/// * `strain_map` - haploset to strain assignments
pub fn resolve_record<'a>(
    reference_name: Option<&str>, query_name: &str,
    read_assignment: &'a ReadAssignment, strain_map: &StrainMap
) -> RecordResolution<'a> {
    let reference_name: &str = match reference_name {
        Some(r) => r,
        None => return RecordResolution::NoHaploset
    };
    match read_assignment.haploset(reference_name, query_name) {
        Some(haploset) => RecordResolution::Haploset {
            haploset,
            strain: strain_map.strain(reference_name, haploset)
        },
        None => RecordResolution::NoHaploset
    }
}

/// Counts from an annotation pass
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AnnotationStats {
    /// total records read, across all passes
    pub records_read: u64,
    /// records that received a haploset tag
    pub haploset_tagged: u64,
    /// records that received a strain tag
    pub strain_tagged: u64,
    /// number of records written to each output
    pub records_written: Vec<(PathBuf, u64)>
}

/// Output filename for tag mode, `<basename>.bam`
pub fn tag_output_filename(basename: &Path) -> PathBuf {
    let mut filename = basename.to_owned().into_os_string();
    filename.push(".bam");
    PathBuf::from(filename)
}

/// Output filename for a strain in split mode, `<basename>.<strain>.bam`
pub fn split_output_filename(basename: &Path, strain: usize) -> PathBuf {
    let mut filename = basename.to_owned().into_os_string();
    filename.push(format!(".{strain}.bam"));
    PathBuf::from(filename)
}

/// Copies every record to a single output, adding haploset and strain tags where they are known.
/// # Arguments
/// * `source` - the input alignments, read once from the start
/// * `output_filename` - the output file
/// * `read_assignment` - read to haploset assignments
/// * `strain_map` - haploset to strain assignments
/// # Errors
/// * if the source, tagging, or the output fails; the output is still closed
pub fn write_tagged<S: AlignmentSource>(
    source: &mut S, output_filename: &Path,
    read_assignment: &ReadAssignment, strain_map: &StrainMap
) -> Result<AnnotationStats, Box<dyn Error>> {
    info!("Writing the alignments in tag mode to {:?}.", output_filename);
    source.rewind()?;
    let mut sink = source.create_sink(output_filename)?;
    let mut stats: AnnotationStats = Default::default();
    let mut written: u64 = 0;

    while let Some(record_result) = source.read_next() {
        let mut record = record_result?;
        stats.records_read += 1;

        let resolution = resolve_record(
            source.reference_name(&record), &record.query_name(),
            read_assignment, strain_map
        );
        if let RecordResolution::Haploset { haploset, strain } = resolution {
            record.set_string_tag(HAPLOSET_TAG, haploset)?;
            stats.haploset_tagged += 1;
            if let Some(s) = strain {
                record.set_integer_tag(STRAIN_TAG, s.try_into()?)?;
                stats.strain_tagged += 1;
            }
        }
        sink.write_record(&record)?;
        written += 1;
    }

    stats.records_written.push((output_filename.to_path_buf(), written));
    debug!("Wrote {} / {} records to {:?}", written, stats.records_read, output_filename);
    Ok(stats)
}

/// Writes one output per strain, rewinding the source before each one.
/// Records of a haploset assigned to the strain are tagged and written, records without a haploset are copied to every output, and all others are left out.
/// # Arguments
/// * `source` - the input alignments, must support rewinding
/// * `basename` - outputs are written to `<basename>.<strain>.bam`
/// * `strains` - the strain ids to write
/// * `read_assignment` - read to haploset assignments
/// * `strain_map` - haploset to strain assignments
/// # Errors
/// * if the source, tagging, or any output fails; opened outputs are still closed
pub fn write_split<S: AlignmentSource>(
    source: &mut S, basename: &Path, strains: &[usize],
    read_assignment: &ReadAssignment, strain_map: &StrainMap
) -> Result<AnnotationStats, Box<dyn Error>> {
    let mut stats: AnnotationStats = Default::default();
    if strains.is_empty() {
        warn!("No strains were found, no split alignment files will be written.");
    }

    for &strain in strains.iter() {
        let output_filename: PathBuf = split_output_filename(basename, strain);
        info!("Writing the alignments in split mode for strain {} to {:?}", strain, output_filename);
        source.rewind()?;
        let mut sink = source.create_sink(&output_filename)?;
        let mut written: u64 = 0;

        while let Some(record_result) = source.read_next() {
            let mut record = record_result?;
            stats.records_read += 1;

            let resolution = resolve_record(
                source.reference_name(&record), &record.query_name(),
                read_assignment, strain_map
            );
            match resolution {
                RecordResolution::NoHaploset => {
                    sink.write_record(&record)?;
                    written += 1;
                },
                RecordResolution::Haploset { haploset, strain: Some(s) } if s == strain => {
                    record.set_string_tag(HAPLOSET_TAG, haploset)?;
                    record.set_integer_tag(STRAIN_TAG, s.try_into()?)?;
                    stats.haploset_tagged += 1;
                    stats.strain_tagged += 1;
                    sink.write_record(&record)?;
                    written += 1;
                },
                RecordResolution::Haploset { .. } => {}
            };
        }

        debug!("Wrote {} records to {:?}", written, output_filename);
        stats.records_written.push((output_filename, written));
    }
    Ok(stats)
}

/// Runs the requested output mode.
/// # Arguments
/// * `source` - the input alignments
/// * `mode` - tag or split
/// * `basename` - prefix for the output files
/// * `strains` - strain ids, only used in split mode
/// * `read_assignment` - read to haploset assignments
/// * `strain_map` - haploset to strain assignments
/// # Errors
/// * see `write_tagged(...)` and `write_split(...)`
pub fn annotate_alignments<S: AlignmentSource>(
    source: &mut S, mode: OutputMode, basename: &Path, strains: &[usize],
    read_assignment: &ReadAssignment, strain_map: &StrainMap
) -> Result<AnnotationStats, Box<dyn Error>> {
    match mode {
        OutputMode::Tag => write_tagged(source, &tag_output_filename(basename), read_assignment, strain_map),
        OutputMode::Split => write_split(source, basename, strains, read_assignment, strain_map)
    }
}

impl TaggableRecord for bam::Record {
    fn query_name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.qname())
    }

    fn set_string_tag(&mut self, tag: &[u8], value: &str) -> Result<(), Box<dyn Error>> {
        if self.aux(tag).is_ok() {
            self.remove_aux(tag)?;
        }
        self.push_aux(tag, bam::record::Aux::String(value))?;
        Ok(())
    }

    fn set_integer_tag(&mut self, tag: &[u8], value: i32) -> Result<(), Box<dyn Error>> {
        if self.aux(tag).is_ok() {
            self.remove_aux(tag)?;
        }
        self.push_aux(tag, bam::record::Aux::I32(value))?;
        Ok(())
    }
}

/// BAM/SAM/CRAM input backed by htslib; rewinding reopens the file
pub struct HtslibBamSource {
    /// the file we are reading
    filename: PathBuf,
    /// the current reader
    reader: bam::Reader,
    /// header of the input, also the template for outputs
    header: bam::HeaderView,
    /// reference names, indexed by tid
    target_names: Vec<String>,
    /// optional shared thread pool for BAM I/O
    thread_pool: Option<rust_htslib::tpool::ThreadPool>
}

impl HtslibBamSource {
    /// Opens an alignment file.
    /// # Arguments
    /// * `filename` - the alignment file
    /// * `thread_pool` - optional shared thread pool for readers and writers
    pub fn new(filename: &Path, thread_pool: Option<&rust_htslib::tpool::ThreadPool>) -> Result<HtslibBamSource, rust_htslib::errors::Error> {
        let mut reader: bam::Reader = bam::Reader::from_path(filename)?;
        if let Some(tp) = thread_pool {
            reader.set_thread_pool(tp)?;
        }
        let header: bam::HeaderView = reader.header().clone();
        let target_names: Vec<String> = header.target_names().iter()
            .map(|s| String::from_utf8_lossy(s).to_string())
            .collect();
        Ok(HtslibBamSource {
            filename: filename.to_path_buf(),
            reader,
            header,
            target_names,
            thread_pool: thread_pool.cloned()
        })
    }
}

impl AlignmentSource for HtslibBamSource {
    type Record = bam::Record;
    type Sink = HtslibBamSink;

    fn rewind(&mut self) -> Result<(), Box<dyn Error>> {
        let mut reader: bam::Reader = bam::Reader::from_path(&self.filename)?;
        if let Some(tp) = self.thread_pool.as_ref() {
            reader.set_thread_pool(tp)?;
        }
        self.reader = reader;
        Ok(())
    }

    fn read_next(&mut self) -> Option<Result<bam::Record, Box<dyn Error>>> {
        let mut record = bam::Record::new();
        match self.reader.read(&mut record) {
            None => None,
            Some(Ok(())) => Some(Ok(record)),
            Some(Err(e)) => Some(Err(Box::new(e)))
        }
    }

    fn reference_name<'a>(&'a self, record: &'a bam::Record) -> Option<&'a str> {
        let tid: i32 = record.tid();
        if tid < 0 {
            None
        } else {
            self.target_names.get(tid as usize).map(|s| s.as_str())
        }
    }

    fn create_sink(&self, filename: &Path) -> Result<HtslibBamSink, Box<dyn Error>> {
        HtslibBamSink::new(filename, &self.header, self.thread_pool.as_ref())
    }
}

/// BAM output backed by htslib; the file is closed when this is dropped
pub struct HtslibBamSink {
    writer: bam::Writer
}

impl HtslibBamSink {
    /// Creates a BAM file using a template header, adding a @PG line for this run.
    /// # Arguments
    /// * `filename` - the output file
    /// * `template` - header of the input file
    /// * `thread_pool` - optional shared thread pool for BAM I/O
    pub fn new(filename: &Path, template: &bam::HeaderView, thread_pool: Option<&rust_htslib::tpool::ThreadPool>) -> Result<HtslibBamSink, Box<dyn Error>> {
        let mut output_header: bam::header::Header = bam::header::Header::from_template(template);
        let cli_string: String = std::env::args().collect::<Vec<String>>().join(" ");
        let cli_version: &str = &crate::cli::FULL_VERSION;

        let mut cli_record = bam::header::HeaderRecord::new("PG".as_bytes());
        cli_record.push_tag("PN".as_bytes(), &"strainer");
        cli_record.push_tag("ID".as_bytes(), &format!("strainer-v{cli_version}"));
        cli_record.push_tag("VN".as_bytes(), &cli_version);
        cli_record.push_tag("CL".as_bytes(), &cli_string);
        output_header.push_record(&cli_record);

        let mut writer: bam::Writer = bam::Writer::from_path(filename, &output_header, bam::Format::Bam)?;
        if let Some(tp) = thread_pool {
            writer.set_thread_pool(tp)?;
        }
        Ok(HtslibBamSink { writer })
    }
}

impl AlignmentSink<bam::Record> for HtslibBamSink {
    fn write_record(&mut self, record: &bam::Record) -> Result<(), Box<dyn Error>> {
        self.writer.write(record)?;
        Ok(())
    }
}
