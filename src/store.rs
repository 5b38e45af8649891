use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::common::AssignmentMap;
use crate::error::StoreError;



/// On-disk layout of the assignment store.
#[derive(Clone)]
#[derive(Debug)]
#[derive(Default)]
#[derive(PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct StoreFile {
	#[serde(default)]
	pub virtual_ips: AssignmentMap,
	#[serde(default)]
	pub last_updated: Option<DateTime<Utc>>,
}

/// JSON file holding every virtual address assignment.
pub struct AssignmentStore {
	path: PathBuf,
}

impl AssignmentStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// A missing file is an empty store.
	pub async fn load(&self) -> Result<StoreFile, StoreError> {
		let bytes = match tokio::fs::read(&self.path).await {
			Ok(bytes) => bytes,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(StoreFile::default()),
			Err(source) => return Err(StoreError::Io { path: self.path.clone(), source }),
		};
		serde_json::from_slice(&bytes).map_err(|source| StoreError::Malformed { path: self.path.clone(), source })
	}

	/// Replaces the whole file with `assignments`.
	pub async fn save(&self, assignments: &AssignmentMap) -> Result<(), StoreError> {
		let file = StoreFile {
			virtual_ips: assignments.clone(),
			last_updated: Some(Utc::now()),
		};
		let json = serde_json::to_vec_pretty(&file).map_err(StoreError::Serialize)?;

		if let Some(parent) = self.path.parent() {
			if !parent.as_os_str().is_empty() {
				tokio::fs::create_dir_all(parent).await.map_err(|source| self.io_error(source))?;
			}
		}

		// Write beside the target and rename over it so readers never see half a file.
		let temp_path = self.path.with_extension("json.tmp");
		let temp = tokio::fs::File::create(&temp_path).await.map_err(|source| self.io_error(source))?;
		let mut writer = tokio::io::BufWriter::new(temp);
		writer.write_all(&json).await.map_err(|source| self.io_error(source))?;
		writer.flush().await.map_err(|source| self.io_error(source))?;
		writer.into_inner().sync_all().await.map_err(|source| self.io_error(source))?;
		tokio::fs::rename(&temp_path, &self.path).await.map_err(|source| self.io_error(source))?;
		Ok(())
	}

	fn io_error(&self, source: std::io::Error) -> StoreError {
		StoreError::Io { path: self.path.clone(), source }
	}
}
