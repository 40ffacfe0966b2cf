
use crate::data_types::records::{FrequencyRecord, MergedRecord};

use log::{debug, info};
use std::collections::BTreeMap;

/// Sums values that share a key, returning the totals ordered by key.
/// # Arguments
/// * `pairs` - (key, value) pairs in any order
pub fn sum_by_key<K, I>(pairs: I) -> BTreeMap<K, u64>
where
    K: Ord,
    I: IntoIterator<Item = (K, u64)>
{
    let mut totals: BTreeMap<K, u64> = BTreeMap::new();
    for (key, value) in pairs {
        *totals.entry(key).or_insert(0) += value;
    }
    totals
}

/// Computes allele frequencies across all confident haplosets and attaches them back to each haploset that observed the allele.
/// The output is ordered by (contig, pos, allele) and then by input order, with one row per merged row that passed the filter.
/// Loci with zero total coverage are excluded.
/// # Arguments
/// * `merged` - the merged haploset/allele support relation
/// * `hapq_cut` - rows from haplosets with HAPQ below this value are ignored
pub fn compute_frequencies(merged: &[MergedRecord], hapq_cut: u32) -> Vec<FrequencyRecord> {
    let confident: Vec<&MergedRecord> = merged.iter()
        .filter(|m| m.hapq >= hapq_cut)
        .collect();
    debug!("{} / {} merged rows pass HAPQ >= {}", confident.len(), merged.len(), hapq_cut);

    // support per allele, then coverage per locus
    let allele_support: BTreeMap<(&str, u64, u32), u64> = sum_by_key(
        confident.iter().map(|m| ((m.contig.as_str(), m.pos, m.allele), m.support))
    );
    let coverage: BTreeMap<(&str, u64), u64> = sum_by_key(
        allele_support.iter().map(|(&(contig, pos, _allele), &support)| ((contig, pos), support))
    );

    // every haploset that observed each allele, duplicates included
    let mut allele_haplosets: BTreeMap<(&str, u64, u32), Vec<&str>> = BTreeMap::new();
    for m in confident.iter() {
        allele_haplosets.entry((m.contig.as_str(), m.pos, m.allele))
            .or_default()
            .push(m.haploset.as_str());
    }

    let mut frequencies: Vec<FrequencyRecord> = Vec::with_capacity(confident.len());
    let mut zero_coverage: usize = 0;
    for (&(contig, pos, allele), &support) in allele_support.iter() {
        let locus_coverage: u64 = coverage.get(&(contig, pos)).copied().unwrap_or(0);
        if locus_coverage == 0 {
            zero_coverage += 1;
            continue;
        }
        let freq: f64 = support as f64 / locus_coverage as f64;
        let maf: u8 = if freq > 0.5 { 1 } else { 0 };
        for &haploset in allele_haplosets.get(&(contig, pos, allele)).into_iter().flatten() {
            frequencies.push(FrequencyRecord {
                contig: contig.to_string(),
                pos,
                allele,
                haploset: haploset.to_string(),
                support,
                coverage: locus_coverage,
                freq,
                maf
            });
        }
    }

    if zero_coverage > 0 {
        debug!("Excluded {} alleles at loci with zero coverage", zero_coverage);
    }
    let covered_loci: usize = coverage.values().filter(|&&c| c > 0).count();
    info!("Computed {} allele frequency observations over {} loci", frequencies.len(), covered_loci);
    frequencies
}
