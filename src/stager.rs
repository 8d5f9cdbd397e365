//! Content-addressed staging store: a write-once landing zone for file
//! content before the transitioner moves it into the synchronization
//! root.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::fs as afs;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::cache::Cache;
use crate::error::StageError;
use crate::hash::{Hasher, HashAlgorithm};

#[derive(Clone)]
pub struct Stager {
	root: PathBuf,
	max_file_size: Option<u64>,
	hash_algorithm: HashAlgorithm,
}

impl Stager {
	pub fn new(root: PathBuf, max_file_size: Option<u64>, hash_algorithm: HashAlgorithm) -> Self {
		Self { root, max_file_size, hash_algorithm }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	async fn ensure_dir(path: &Path) -> Result<(), StageError> {
		afs::create_dir_all(path).await.map_err(StageError::Io)
	}

	/// Short-circuits a transfer when `digest` already exists somewhere
	/// under the synchronization root, per the reverse-lookup optimization.
	pub fn reverse_lookup(&self, cache: &Cache, root: &Path, digest: &[u8]) -> Option<PathBuf> {
		cache.reverse_lookup(digest).map(|relative| root.join(relative))
	}

	/// Opens a write sink for `path`. The digest is accumulated as bytes
	/// are written and the file is renamed into its content-addressed
	/// location only once the sink is committed.
	pub async fn sink(&self, path: &str) -> Result<StagingSink, StageError> {
		let tmp_dir = self.root.join(".tmp");
		Self::ensure_dir(&tmp_dir).await?;
		let tmp_path = tmp_dir.join(uuid::Uuid::new_v4().to_string());
		let file = afs::File::create(&tmp_path).await.map_err(StageError::Io)?;
		Ok(StagingSink {
			root: self.root.clone(),
			path_key: path.to_string(),
			tmp_path,
			file,
			hasher: self.hash_algorithm.hasher(),
			written: 0,
			max_file_size: self.max_file_size,
		})
	}

	/// Returns the staged file's path for `path`/`digest`, if present.
	pub async fn provide(&self, path: &str, digest: &[u8]) -> Result<PathBuf, StageError> {
		let candidate = self.staged_path(path, digest);
		match afs::metadata(&candidate).await {
			Ok(_) => Ok(candidate),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				Err(StageError::NotFound { path: path.to_string() })
			}
			Err(e) => Err(StageError::Io(e)),
		}
	}

	/// Removes the entire staging tree. The root is recreated lazily by the
	/// next `sink()` call.
	pub async fn wipe(&self) -> Result<(), StageError> {
		match afs::remove_dir_all(&self.root).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(StageError::Io(e)),
		}
	}

	fn staged_path(&self, path: &str, digest: &[u8]) -> PathBuf {
		staged_path(&self.root, path, digest)
	}
}

fn staged_path(root: &Path, path: &str, digest: &[u8]) -> PathBuf {
	let bucket = digest.first().map(|b| format!("{:02x}", b)).unwrap_or_else(|| "00".to_string());
	let path_hash = crate::hash::digest_to_hex(&crate::hash::digest(HashAlgorithm::Blake3, path.as_bytes()));
	let file_name = format!("{}_{}", path_hash, crate::hash::digest_to_hex(digest));
	root.join(bucket).join(file_name)
}

pub struct StagingSink {
	root: PathBuf,
	path_key: String,
	tmp_path: PathBuf,
	file: afs::File,
	hasher: Box<dyn Hasher>,
	written: u64,
	max_file_size: Option<u64>,
}

impl StagingSink {
	pub async fn write(&mut self, bytes: &[u8]) -> Result<(), StageError> {
		self.written += bytes.len() as u64;
		if let Some(limit) = self.max_file_size {
			if self.written > limit {
				return Err(StageError::SizeLimitExceeded { path: self.path_key.clone(), limit });
			}
		}
		self.hasher.update(bytes);
		self.file.write_all(bytes).await.map_err(StageError::Io)
	}

	/// Finalizes the sink: flushes the temp file, renames it into its
	/// content-addressed location, and returns the computed digest.
	pub async fn commit(mut self) -> Result<(Vec<u8>, PathBuf), StageError> {
		self.file.flush().await.map_err(StageError::Io)?;
		self.file.sync_all().await.map_err(StageError::Io)?;
		let digest = self.hasher.finalize();
		let destination = staged_path(&self.root, &self.path_key, &digest);
		if let Some(parent) = destination.parent() {
			Stager::ensure_dir(parent).await?;
		}
		afs::rename(&self.tmp_path, &destination).await.map_err(StageError::Io)?;
		Ok((digest, destination))
	}

	pub async fn discard(self) -> Result<(), StageError> {
		match afs::remove_file(&self.tmp_path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(StageError::Io(e)),
		}
	}
}

/// Lets `rsync::patch`/`rsync::receive_file` write straight into a staging
/// sink, hashing each accepted chunk as it lands on disk.
impl AsyncWrite for StagingSink {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		match Pin::new(&mut this.file).poll_write(cx, buf) {
			Poll::Ready(Ok(n)) => {
				this.written += n as u64;
				if let Some(limit) = this.max_file_size {
					if this.written > limit {
						return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "staging size limit exceeded")));
					}
				}
				this.hasher.update(&buf[..n]);
				Poll::Ready(Ok(n))
			}
			other => other,
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().file).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
	}
}


// vim: ts=4
