
use rustc_hash::FxHashMap as HashMap;

/// Final haploset to strain assignment, split by contig
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StrainMap {
    /// key is contig, value is a map from haploset to strain id
    contig_strains: HashMap<String, HashMap<String, usize>>
}

impl StrainMap {
    pub fn new() -> StrainMap {
        Self::default()
    }

    /// Assigns a haploset to a strain, returning any previous assignment
    pub fn insert(&mut self, contig: &str, haploset: &str, strain: usize) -> Option<usize> {
        self.contig_strains.entry(contig.to_string())
            .or_default()
            .insert(haploset.to_string(), strain)
    }

    /// Looks up the strain for a haploset on a contig
    pub fn strain(&self, contig: &str, haploset: &str) -> Option<usize> {
        self.contig_strains.get(contig)
            .and_then(|haplosets| haplosets.get(haploset))
            .copied()
    }

    pub fn contig_strains(&self, contig: &str) -> Option<&HashMap<String, usize>> {
        self.contig_strains.get(contig)
    }

    pub fn contains_contig(&self, contig: &str) -> bool {
        self.contig_strains.contains_key(contig)
    }

    pub fn is_empty(&self) -> bool {
        self.contig_strains.is_empty()
    }

    /// Total number of haplosets with a strain
    pub fn num_haplosets(&self) -> usize {
        self.contig_strains.values().map(|h| h.len()).sum()
    }

    /// Returns every (contig, haploset, strain) sorted by contig and then haploset.
    pub fn sorted_entries(&self) -> Vec<(&str, &str, usize)> {
        let mut entries: Vec<(&str, &str, usize)> = self.contig_strains.iter()
            .flat_map(|(contig, haplosets)| {
                haplosets.iter().map(move |(haploset, &strain)| (contig.as_str(), haploset.as_str(), strain))
            })
            .collect();
        entries.sort();
        entries
    }
}
