use marmot_domain::Mrn;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("lineage edge references unknown asset '{0}'")]
    DanglingMrn(Mrn),

    #[error("lineage cycle detected through asset '{0}'")]
    CycleDetected(Mrn),
}
