use primer_orca::*;
use std::path::PathBuf;

/// Initial primer sets as the optimizer writes them: forward and reverse
/// sets separated by `\tx\t`, one pair per line.
pub const INIT_PRIMERS: &str = "ACGTAC\tACGTAG\tx\tTTGCAA\n\
                                ACGTAC\tACGTACG\tx\tTTGCAA\tTTGCAT\n";

pub const INIT_SCORES: &str = "Efficiency\tCoverage\tMatching-bias\n\
                               0.41\t0.77\t0.12\n\
                               0.38\t0.80\t0.15\n";

pub const OUT_PRIMERS: &str = "ACGTAC\tACGTAT\tx\tTTGCAA\n\
                               ACGTCC\tACGTAC\tx\tTTGCAG\tTTGCAA\n";

pub const OUT_SCORES: &str = "Efficiency\tCoverage\tMatching-bias\n\
                              0.62\t0.91\t0.05\n\
                              0.58\t0.93\t0.07\n";

/// Builder for jobs with valid default parameters.
#[derive(Clone, Debug)]
pub struct JobFixture {
    owner: String,
    is_public: bool,
    parameters: Vec<(String, String)>,
    sequence_set: PathBuf,
    primer_pairs: String,
    primer_pairs_id: i64,
}

impl Default for JobFixture {
    fn default() -> Self {
        Self {
            owner: "tester".to_string(),
            is_public: false,
            parameters: Vec::new(),
            sequence_set: PathBuf::from("/data/rep_set.fasta"),
            primer_pairs: ">pair1\nACGTAC\tTTGCAA\n".to_string(),
            primer_pairs_id: 1,
        }
    }
}

impl JobFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn public(mut self) -> Self {
        self.is_public = true;
        self
    }

    /// Set a declared parameter, e.g. `param("runs", "2")`.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((name.into(), value.into()));
        self
    }

    pub fn sequence_set(mut self, path: impl Into<PathBuf>) -> Self {
        self.sequence_set = path.into();
        self
    }

    pub fn primer_pairs(mut self, id: i64, content: impl Into<String>) -> Self {
        self.primer_pairs_id = id;
        self.primer_pairs = content.into();
        self
    }

    /// Build against the default parameter registry.
    pub fn build(self) -> Job {
        self.build_with(&ParameterRegistry::default())
    }

    /// Build against `registry`. Panics on invalid parameters.
    pub fn build_with(self, registry: &ParameterRegistry) -> Job {
        let parameters = registry
            .resolve(
                self.parameters
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.as_str())),
            )
            .expect("fixture parameters must be valid");
        Job::new(
            self.owner,
            parameters,
            SequenceSetRef {
                id: 1,
                path: self.sequence_set,
            },
            PrimerPairsRef {
                id: self.primer_pairs_id,
                content: self.primer_pairs,
            },
        )
        .with_visibility(self.is_public)
    }
}
