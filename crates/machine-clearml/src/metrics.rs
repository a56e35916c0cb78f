// Archivo: metrics.rs
// Propósito: ClearML indexa métricas y variantes por el MD5 (hex en
// minúsculas) de su nombre visible; estas claves se precalculan.
use md5::{Digest, Md5};
use once_cell::sync::Lazy;

pub static SUMMARY_METRIC: Lazy<String> = Lazy::new(|| metric_key("Summary"));
pub static TRAIN_CORPUS_SIZE_VARIANT: Lazy<String> = Lazy::new(|| metric_key("train_corpus_size"));
pub static CONFIDENCE_VARIANT: Lazy<String> = Lazy::new(|| metric_key("confidence"));

pub fn metric_key(name: &str) -> String {
  let digest = Md5::digest(name.as_bytes());
  digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn keys_are_lowercase_md5_hex() {
    assert_eq!(metric_key(""), "d41d8cd98f00b204e9800998ecf8427e");
    assert_eq!(metric_key("abc"), "900150983cd24fb0d6963f7d28e17f72");
    assert_eq!(SUMMARY_METRIC.len(), 32);
    assert_ne!(*TRAIN_CORPUS_SIZE_VARIANT, *CONFIDENCE_VARIANT);
  }
}
