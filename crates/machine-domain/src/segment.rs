// segment.rs
// Par de segmentos entrenado de forma incremental durante un build.
use data_access::Entity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainSegmentPair {
  pub id: String,
  pub engine_id: String,
  pub source: String,
  pub target: String,
  pub revision: i64,
}

impl TrainSegmentPair {
  pub fn new(id: &str, engine_id: &str, source: &str, target: &str) -> Self {
    Self { id: id.to_string(),
           engine_id: engine_id.to_string(),
           source: source.to_string(),
           target: target.to_string(),
           revision: 0 }
  }
}

impl Entity for TrainSegmentPair {
  fn id(&self) -> &str {
    &self.id
  }

  fn revision(&self) -> i64 {
    self.revision
  }

  fn set_revision(&mut self, revision: i64) {
    self.revision = revision;
  }
}
