/// Utility functions for SST training
use candle_nn::VarMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Total number of scalar parameters registered in a VarMap
pub fn count_parameters(varmap: &VarMap) -> usize {
    varmap
        .all_vars()
        .iter()
        .map(|v| v.dims().iter().product::<usize>())
        .sum()
}

/// Append-only per-run loss log, `<dir>/<method_name>_loss.txt`
///
/// One tab-separated line per epoch: `epoch  train_loss  val_loss`.
pub struct LossLog {
    path: PathBuf,
    file: File,
}

impl LossLog {
    pub fn open<P: AsRef<Path>>(dir: P, method_name: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(format!("{}_loss.txt", method_name));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn append(&mut self, epoch: usize, train_loss: f64, val_loss: f64) -> std::io::Result<()> {
        writeln!(self.file, "{}\t{:.6}\t{:.6}", epoch, train_loss, val_loss)?;
        self.file.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    #[test]
    fn test_count_parameters() -> candle_core::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &Device::Cpu);
        vb.get((3, 4), "a")?;
        vb.get(5, "b")?;

        assert_eq!(count_parameters(&varmap), 17);

        Ok(())
    }

    #[test]
    fn test_loss_log_appends() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut log = LossLog::open(dir.path(), "baseline")?;
        log.append(0, 0.5, 0.75)?;
        drop(log);

        let mut log = LossLog::open(dir.path(), "baseline")?;
        log.append(1, 0.25, 0.5)?;

        let contents = std::fs::read_to_string(log.path())?;
        assert!(log.path().ends_with("baseline_loss.txt"));
        assert_eq!(contents, "0\t0.500000\t0.750000\n1\t0.250000\t0.500000\n");

        Ok(())
    }
}
