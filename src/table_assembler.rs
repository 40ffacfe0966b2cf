
use crate::data_types::records::{HaplosetRecord, MergedRecord, ReadAssignment, VariantSupportRecord};
use crate::record_parser::{ContigPloidy, ParseError, parse_contig_ploidy, parse_haplosets, parse_vartig_info, parse_vartigs};

use log::{debug, info, warn};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use simple_error::bail;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use threadpool::ThreadPool;

/// Name of the per-sample ploidy summary in a floria output folder
pub const CONTIG_PLOIDY_FILENAME: &str = "contig_ploidy_info.tsv";
/// Name of the per-contig allele support file
pub const VARTIG_INFO_FILENAME: &str = "vartig_info.txt";

/// Everything loaded from a floria output folder
#[derive(Debug, Default)]
pub struct AssembledTables {
    /// contigs in the order they appear in the ploidy summary
    pub contigs: Vec<String>,
    /// variant support joined to haploset HAPQ across all contigs
    pub merged: Vec<MergedRecord>,
    /// rounded mean of the per-contig strain counts
    pub strain_count_hint: usize,
    /// reads of confident haplosets across all contigs
    pub read_assignment: ReadAssignment
}

/// The parsed files for a single contig
#[derive(Debug, Default)]
struct ContigTables {
    haplosets: Vec<HaplosetRecord>,
    read_assignment: ReadAssignment,
    variants: Vec<VariantSupportRecord>
}

/// Returns the haploset listing for a contig.
/// This is `<contig>.haplosets` unless only a `<contig>.vartigs` listing is present.
pub fn haploset_filename(floria_outdir: &Path, contig: &str) -> PathBuf {
    let contig_dir: PathBuf = floria_outdir.join(contig);
    let haplosets_fn: PathBuf = contig_dir.join(format!("{contig}.haplosets"));
    let vartigs_fn: PathBuf = contig_dir.join(format!("{contig}.vartigs"));
    if !haplosets_fn.exists() && vartigs_fn.exists() {
        vartigs_fn
    } else {
        haplosets_fn
    }
}

/// Loads the haploset listing and the allele support for one contig.
fn load_contig(floria_outdir: &Path, contig: &str, hapq_cut: u32) -> Result<ContigTables, ParseError> {
    let listing_fn: PathBuf = haploset_filename(floria_outdir, contig);
    let (haplosets, read_assignment) = if listing_fn.extension().unwrap_or_default() == "vartigs" {
        debug!("No haploset listing for {}, using {:?} without read assignments", contig, listing_fn);
        (parse_vartigs(&listing_fn)?, ReadAssignment::new())
    } else {
        parse_haplosets(&listing_fn, hapq_cut)?
    };
    let variants = parse_vartig_info(&floria_outdir.join(contig).join(VARTIG_INFO_FILENAME))?;
    Ok(ContigTables {
        haplosets,
        read_assignment,
        variants
    })
}

/// Derives the default number of strains from the ploidy summary, `None` if there are no rows.
/// The mean is rounded half-to-even.
pub fn strain_count_hint(ploidy_rows: &[ContigPloidy]) -> Option<usize> {
    if ploidy_rows.is_empty() {
        return None;
    }
    let total: f64 = ploidy_rows.iter().map(|r| r.average_strain_count).sum();
    let mean: f64 = total / ploidy_rows.len() as f64;
    Some(mean.round_ties_even().max(0.0) as usize)
}

/// Inner-joins allele support onto haploset HAPQ by (contig, haploset).
/// Support rows without a haploset are dropped, and haplosets listed more than once multiply their rows.
pub fn join_tables(haplosets: &[HaplosetRecord], variants: &[VariantSupportRecord]) -> Vec<MergedRecord> {
    let mut hapq_lookup: HashMap<(&str, &str), Vec<u32>> = Default::default();
    for h in haplosets.iter() {
        hapq_lookup.entry((h.contig.as_str(), h.haploset.as_str()))
            .or_default()
            .push(h.hapq);
    }

    let mut merged: Vec<MergedRecord> = Vec::with_capacity(variants.len());
    let mut unmatched: usize = 0;
    for v in variants.iter() {
        match hapq_lookup.get(&(v.contig.as_str(), v.haploset.as_str())) {
            Some(hapqs) => {
                merged.extend(hapqs.iter().map(|&hapq| MergedRecord::from_join(v, hapq)));
            },
            None => unmatched += 1
        };
    }
    if unmatched > 0 {
        debug!("{} allele support rows had no matching haploset and were dropped", unmatched);
    }
    merged
}

/// Loads a full floria output folder: the ploidy summary, then every contig's haplosets and allele support.
/// # Arguments
/// * `floria_outdir` - the floria output folder
/// * `hapq_cut` - reads are only assigned for haplosets with HAPQ >= this value
/// * `threads` - number of contigs to parse in parallel
/// # Errors
/// * if any required file is missing or unreadable, or if the ploidy summary has no contigs
pub fn assemble_tables(floria_outdir: &Path, hapq_cut: u32, threads: usize) -> Result<AssembledTables, Box<dyn std::error::Error>> {
    let ploidy_fn: PathBuf = floria_outdir.join(CONTIG_PLOIDY_FILENAME);
    let ploidy_rows: Vec<ContigPloidy> = parse_contig_ploidy(&ploidy_fn)?;
    let strain_count_hint: usize = strain_count_hint(&ploidy_rows)
        .ok_or(ParseError::NoContigs { path: ploidy_fn.clone() })?;

    let mut contig_set: HashSet<&str> = Default::default();
    let contigs: Vec<String> = ploidy_rows.iter()
        .filter(|r| contig_set.insert(r.contig.as_str()))
        .map(|r| r.contig.clone())
        .collect();
    info!("Found {} contigs in {:?}, strain count hint: {}", contigs.len(), ploidy_fn, strain_count_hint);

    let mut contig_tables: Vec<ContigTables> = Vec::with_capacity(contigs.len());
    if threads <= 1 {
        for contig in contigs.iter() {
            contig_tables.push(load_contig(floria_outdir, contig, hapq_cut)?);
        }
    } else {
        let pool = ThreadPool::new(threads);
        let (tx, rx) = mpsc::channel();
        for (contig_index, contig) in contigs.iter().enumerate() {
            let tx = tx.clone();
            let floria_outdir: PathBuf = floria_outdir.to_path_buf();
            let contig: String = contig.clone();
            pool.execute(move || {
                let result = load_contig(&floria_outdir, &contig, hapq_cut);
                tx.send((contig_index, result)).expect("channel will be there waiting for the pool");
            });
        }
        std::mem::drop(tx);

        // results arrive in any order, so slot them back into contig order before unioning
        let mut slots: Vec<Option<Result<ContigTables, ParseError>>> = (0..contigs.len()).map(|_| None).collect();
        for (contig_index, result) in rx.iter() {
            slots[contig_index] = Some(result);
        }
        if pool.panic_count() > 0 {
            bail!("Panic detected in ThreadPool while parsing contigs, check above for details.");
        }
        for slot in slots.into_iter() {
            match slot {
                Some(result) => contig_tables.push(result?),
                None => bail!("Contig parsing job finished without a result")
            };
        }
    }

    // union everything across contigs
    let mut haplosets: Vec<HaplosetRecord> = vec![];
    let mut variants: Vec<VariantSupportRecord> = vec![];
    let mut read_assignment: ReadAssignment = ReadAssignment::new();
    for (contig, mut tables) in contigs.iter().zip(contig_tables.into_iter()) {
        debug!("{}: {} haplosets, {} allele support rows, {} assigned reads",
            contig, tables.haplosets.len(), tables.variants.len(), tables.read_assignment.num_reads());
        if tables.haplosets.is_empty() {
            warn!("No haplosets found for contig {}", contig);
        }
        haplosets.append(&mut tables.haplosets);
        variants.append(&mut tables.variants);
        read_assignment.extend(tables.read_assignment);
    }

    let merged: Vec<MergedRecord> = join_tables(&haplosets, &variants);
    info!("Loaded {} haplosets, {} allele support rows, {} merged rows, and {} assigned reads",
        haplosets.len(), variants.len(), merged.len(), read_assignment.num_reads());

    Ok(AssembledTables {
        contigs,
        merged,
        strain_count_hint,
        read_assignment
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ploidy(contig: &str, average_strain_count: f64) -> ContigPloidy {
        ContigPloidy { contig: contig.to_string(), average_strain_count }
    }

    fn haploset(contig: &str, haploset: &str, hapq: u32) -> HaplosetRecord {
        HaplosetRecord { contig: contig.to_string(), haploset: haploset.to_string(), hapq }
    }

    fn variant(contig: &str, haploset: &str, pos: u64, allele: u32, support: u64) -> VariantSupportRecord {
        VariantSupportRecord { contig: contig.to_string(), haploset: haploset.to_string(), pos, cons: 0, allele, support }
    }

    #[test]
    fn test_strain_count_hint() {
        assert_eq!(strain_count_hint(&[]), None);
        assert_eq!(strain_count_hint(&[ploidy("a", 2.0), ploidy("b", 2.0)]), Some(2));
        assert_eq!(strain_count_hint(&[ploidy("a", 1.6), ploidy("b", 2.4)]), Some(2));
        assert_eq!(strain_count_hint(&[ploidy("a", 3.0), ploidy("b", 3.4)]), Some(3));
        // half-way cases round to even
        assert_eq!(strain_count_hint(&[ploidy("a", 2.0), ploidy("b", 3.0)]), Some(2));
        assert_eq!(strain_count_hint(&[ploidy("a", 3.0), ploidy("b", 4.0)]), Some(4));
    }

    #[test]
    fn test_join_tables() {
        let haplosets = vec![
            haploset("c1", "HAP0", 20),
            haploset("c1", "HAP1", 5),
            haploset("c2", "HAP0", 30),
            haploset("c2", "HAP9", 30)
        ];
        let variants = vec![
            variant("c1", "HAP0", 10, 0, 4),
            variant("c1", "HAP1", 10, 1, 3),
            variant("c1", "HAP2", 10, 1, 3), // no haploset, dropped
            variant("c2", "HAP0", 10, 0, 8),
            variant("c3", "HAP0", 10, 0, 8) // no contig, dropped
        ];
        let merged = join_tables(&haplosets, &variants);
        let summary: Vec<(&str, &str, u32, u64)> = merged.iter()
            .map(|m| (m.contig.as_str(), m.haploset.as_str(), m.hapq, m.support))
            .collect();
        assert_eq!(summary, vec![
            ("c1", "HAP0", 20, 4),
            ("c1", "HAP1", 5, 3),
            ("c2", "HAP0", 30, 8)
        ]);
    }

    #[test]
    fn test_join_duplicate_haploset() {
        let haplosets = vec![haploset("c1", "HAP0", 20), haploset("c1", "HAP0", 25)];
        let variants = vec![variant("c1", "HAP0", 10, 0, 4)];
        let merged = join_tables(&haplosets, &variants);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].hapq, 20);
        assert_eq!(merged[1].hapq, 25);
    }

    #[test]
    fn test_assemble_tables() {
        let floria_outdir = PathBuf::from("./test_data/floria_out");
        let tables = assemble_tables(&floria_outdir, 15, 1).unwrap();
        assert_eq!(tables.contigs, vec!["contig_1".to_string(), "contig_2".to_string()]);
        assert_eq!(tables.strain_count_hint, 2);
        assert!(!tables.merged.is_empty());
        assert!(tables.merged.iter().any(|m| m.contig == "contig_1"));
        assert!(tables.merged.iter().any(|m| m.contig == "contig_2"));

        // contig_2 only ships a vartigs listing, so it has no reads
        assert!(tables.read_assignment.haploset("contig_1", "c1_read_0").is_some());
        assert!(tables.read_assignment.contig_reads("contig_2").is_none());

        // threading should not change anything
        let threaded = assemble_tables(&floria_outdir, 15, 4).unwrap();
        assert_eq!(tables.contigs, threaded.contigs);
        assert_eq!(tables.merged, threaded.merged);
        assert_eq!(tables.strain_count_hint, threaded.strain_count_hint);
        assert_eq!(tables.read_assignment, threaded.read_assignment);
    }

    #[test]
    fn test_assemble_missing_dir() {
        let result = assemble_tables(&PathBuf::from("./test_data/no_such_floria_out"), 15, 1);
        assert!(result.is_err());
    }
}
