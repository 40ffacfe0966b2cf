
use rustc_hash::FxHashMap as HashMap;

/// One haploset header reported by floria for a contig
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct HaplosetRecord {
    /// the contig the haploset was phased on
    pub contig: String,
    /// the haploset identifier, e.g. "HAP0"
    pub haploset: String,
    /// the confidence floria assigned to the haploset
    pub hapq: u32
}

/// Support for a single allele at a single locus inside one haploset
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct VariantSupportRecord {
    /// the contig of the locus
    pub contig: String,
    /// the haploset the support was observed in
    pub haploset: String,
    /// the locus position
    pub pos: u64,
    /// the consensus allele of the haploset at this locus
    pub cons: u32,
    /// the observed allele
    pub allele: u32,
    /// the number of reads supporting `allele`
    pub support: u64
}

/// Result of joining a `VariantSupportRecord` to the HAPQ of its `HaplosetRecord`
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct MergedRecord {
    pub contig: String,
    pub haploset: String,
    pub hapq: u32,
    pub pos: u64,
    pub cons: u32,
    pub allele: u32,
    pub support: u64
}

impl MergedRecord {
    /// Joins a variant support row with the HAPQ of its haploset.
    pub fn from_join(variant: &VariantSupportRecord, hapq: u32) -> MergedRecord {
        MergedRecord {
            contig: variant.contig.clone(),
            haploset: variant.haploset.clone(),
            hapq,
            pos: variant.pos,
            cons: variant.cons,
            allele: variant.allele,
            support: variant.support
        }
    }
}

/// Allele frequency of one (contig, pos, allele) as seen from one haploset.
#[derive(Clone, Debug, PartialEq)]
pub struct FrequencyRecord {
    pub contig: String,
    pub pos: u64,
    pub allele: u32,
    pub haploset: String,
    /// summed read support for the allele across all confident haplosets
    pub support: u64,
    /// summed read support for all alleles at the locus
    pub coverage: u64,
    /// support / coverage, always in [0, 1]
    pub freq: f64,
    /// 1 if `freq` > 0.5, else 0
    pub maf: u8
}

/// Cluster label attached to one `FrequencyRecord`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClusterAssignment {
    /// the cluster label
    pub strain: usize,
    /// the posterior probability of `strain`
    pub strain_proba: f64
}

/// Maps reads to the haploset they were phased into, split by contig.
/// Only reads from haplosets passing the HAPQ cutoff at parse time are present.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadAssignment {
    /// key is contig, value is a map from read name to haploset
    contig_reads: HashMap<String, HashMap<String, String>>
}

impl ReadAssignment {
    pub fn new() -> ReadAssignment {
        Self::default()
    }

    /// Records that `read_name` belongs to `haploset` on `contig`.
    /// If the read was already assigned on this contig, the latest assignment wins.
    pub fn insert(&mut self, contig: &str, read_name: String, haploset: String) -> Option<String> {
        self.contig_reads.entry(contig.to_string())
            .or_default()
            .insert(read_name, haploset)
    }

    /// Marks a contig as present even if no reads end up assigned on it
    pub fn add_contig(&mut self, contig: &str) {
        self.contig_reads.entry(contig.to_string()).or_default();
    }

    /// Absorbs all assignments from `other`, later values win on conflicts.
    pub fn extend(&mut self, other: ReadAssignment) {
        for (contig, reads) in other.contig_reads.into_iter() {
            self.contig_reads.entry(contig).or_default().extend(reads);
        }
    }

    /// Returns the read map for a contig, if the contig has one
    pub fn contig_reads(&self, contig: &str) -> Option<&HashMap<String, String>> {
        self.contig_reads.get(contig)
    }

    pub fn contains_contig(&self, contig: &str) -> bool {
        self.contig_reads.contains_key(contig)
    }

    /// Looks up the haploset of a read on a given contig.
    pub fn haploset(&self, contig: &str, read_name: &str) -> Option<&str> {
        self.contig_reads.get(contig)
            .and_then(|reads| reads.get(read_name))
            .map(|h| h.as_str())
    }

    pub fn num_contigs(&self) -> usize {
        self.contig_reads.len()
    }

    /// Total number of assigned reads across all contigs
    pub fn num_reads(&self) -> usize {
        self.contig_reads.values().map(|r| r.len()).sum()
    }
}
