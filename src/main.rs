
use strainer::cli::{Settings, check_settings, get_raw_settings};
use strainer::strainer::{StrainInference, infer_strains};
use strainer::writers::strain_bam_writer::{AnnotationStats, HtslibBamSource, annotate_alignments};
use strainer::writers::strain_table_writer::StrainTableWriter;

use log::{LevelFilter, error, info};
use std::time::Instant;

fn main() {
    // get the settings
    let settings: Settings = get_raw_settings();
    let filter_level: LevelFilter = match settings.verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace
    };

    // immediately setup logging first
    env_logger::builder()
        .format_timestamp_millis()
        .filter_level(filter_level)
        .init();

    // okay, now we can check all the other settings
    let cli_settings: Settings = check_settings(settings);
    let start_time = Instant::now();

    // first, figure out which haplosets belong to which strain
    let inference: StrainInference = match infer_strains(&cli_settings.strainer_config()) {
        Ok(si) => si,
        Err(e) => {
            error!("Error during strain inference: {}", e);
            std::process::exit(exitcode::SOFTWARE);
        }
    };
    info!("Inferred {} strains over {} haplosets in {:?}",
        inference.strains.len(), inference.strain_map.num_haplosets(), start_time.elapsed());

    if let Some(filename) = cli_settings.strain_table_filename.as_ref() {
        let mut table_writer: StrainTableWriter = match StrainTableWriter::new(filename) {
            Ok(tw) => tw,
            Err(e) => {
                error!("Error while creating strain table file: {}", e);
                std::process::exit(exitcode::IOERR);
            }
        };
        match table_writer.write_strain_map(&inference.strain_map) {
            Ok(()) => {},
            Err(e) => {
                error!("Error while writing strain table file: {}", e);
                std::process::exit(exitcode::IOERR);
            }
        };
    }

    // shared thread pool for bam IO
    let io_threads: u32 = cli_settings.io_threads.unwrap_or(1) as u32;
    let bam_thread_pool = match rust_htslib::tpool::ThreadPool::new(io_threads) {
        Ok(btp) => btp,
        Err(e) => {
            error!("Error while starting thread pool: {}", e);
            std::process::exit(exitcode::IOERR);
        }
    };

    let mut bam_source: HtslibBamSource = match HtslibBamSource::new(&cli_settings.bam_filename, Some(&bam_thread_pool)) {
        Ok(bs) => bs,
        Err(e) => {
            error!("Error while opening alignment file: {}", e);
            std::process::exit(exitcode::IOERR);
        }
    };

    let stats: AnnotationStats = match annotate_alignments(
        &mut bam_source, cli_settings.output_mode, &cli_settings.output_basename,
        &inference.strains, &inference.read_assignment, &inference.strain_map
    ) {
        Ok(s) => s,
        Err(e) => {
            error!("Error while writing alignments: {}", e);
            std::process::exit(exitcode::IOERR);
        }
    };

    info!("Alignment stats:");
    info!("\tRecords read: {}", stats.records_read);
    info!("\tHaploset tagged: {}", stats.haploset_tagged);
    info!("\tStrain tagged: {}", stats.strain_tagged);
    for (filename, written) in stats.records_written.iter() {
        info!("\tWrote {} records to {:?}", written, filename);
    }

    info!("Total time: {:?}", start_time.elapsed());
    info!("Strainer finished successfully.");
}
