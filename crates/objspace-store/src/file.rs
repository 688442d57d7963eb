use std::fs::{self, File, OpenOptions, TryLockError};
use std::sync::Arc;

use objspace_crypto::HashFunction;
use tracing::{info, warn};

use crate::buffer::{CheckpointBuffer, ReadableBuffer};
use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};
use crate::header::FileHeader;
use crate::journal::{Journal, JournalState};
use crate::merkle_buffer::MerkleBuffer;
use crate::paged_buffer::PagedBuffer;
use crate::transactional::{apply_record, TransactionalBuffer};

/// The full storage stack over an on-disk file.
pub type TransactionalFile = TransactionalBuffer<MerkleBuffer<PagedBuffer<File>>>;

/// Open (or create) the storage file described by `config`.
///
/// The file is locked exclusively (shared when read-only). A complete
/// journal left by an interrupted commit is replayed, a torn one is
/// discarded. Without a journal the rebuilt Merkle root must equal the
/// root in the header.
pub fn open_file(
    config: &StorageConfig,
    hasher: Arc<dyn HashFunction>,
) -> StoreResult<TransactionalFile> {
    config.validate()?;
    let path = &config.file_path;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !config.read_only {
            fs::create_dir_all(parent)?;
        }
    }

    let file = OpenOptions::new()
        .read(true)
        .write(!config.read_only)
        .create(!config.read_only)
        .truncate(false)
        .open(path)?;
    let locked = if config.read_only {
        file.try_lock_shared()
    } else {
        file.try_lock()
    };
    match locked {
        Ok(()) => {}
        Err(TryLockError::WouldBlock) => return Err(StoreError::Locked(path.clone())),
        Err(TryLockError::Error(e)) => return Err(e.into()),
    }

    let budget = config.page_budget();
    let digest_size = hasher.digest_size();
    let fresh = file.metadata()?.len() == 0;
    let mut paged = if fresh {
        if config.read_only {
            return Err(StoreError::FormatViolation(format!(
                "{} is empty",
                path.display()
            )));
        }
        PagedBuffer::create(file, config.page_size, digest_size, budget)?
    } else {
        PagedBuffer::open(file, config.page_size, digest_size, budget)?
    };
    paged.set_sync_on_checkpoint(config.sync_on_commit);

    let mut merkle = MerkleBuffer::open(paged, hasher, config.page_size)?;
    let journal = Journal::new(config.journal_path());
    match journal.read()? {
        JournalState::Complete(record) => {
            if config.read_only {
                return Err(StoreError::IntegrityViolation(format!(
                    "{} has an unfinished commit; open it writable to recover",
                    path.display()
                )));
            }
            if record.page_size as usize != config.page_size {
                return Err(StoreError::FormatViolation(format!(
                    "journal page size {} does not match {}",
                    record.page_size, config.page_size
                )));
            }
            warn!(
                path = %path.display(),
                pages = record.pages.len(),
                "replaying interrupted commit"
            );
            apply_record(&mut merkle, &record)?;
            merkle.checkpoint(None)?;
            journal.remove()?;
        }
        JournalState::Torn => {
            if !config.read_only {
                journal.remove()?;
            }
            verify_header_root(&merkle)?;
        }
        JournalState::Absent => verify_header_root(&merkle)?,
    }

    info!(
        path = %path.display(),
        length = merkle.len(),
        commits = merkle.inner().header().commit_count,
        read_only = config.read_only,
        "storage file opened"
    );
    Ok(
        TransactionalBuffer::new(merkle, config.page_size, config.max_memory)
            .with_journal(journal)
            .with_spill_dir(config.resolved_page_file_dir())
            .with_read_only(config.read_only)
            .with_sync(config.sync_on_commit),
    )
}

fn verify_header_root(merkle: &MerkleBuffer<PagedBuffer<File>>) -> StoreResult<()> {
    let expected = &merkle.inner().header().root;
    let computed = merkle.root();
    if *expected != computed {
        return Err(StoreError::RootMismatch {
            expected: expected.clone(),
            computed,
        });
    }
    Ok(())
}

/// Read the header of a storage file without opening the full stack.
pub fn read_header(path: &std::path::Path) -> StoreResult<FileHeader> {
    let mut file = File::open(path)?;
    FileHeader::read_from(&mut file)
}

#[cfg(test)]
mod tests {
    use objspace_crypto::ContentHasher;

    use super::*;
    use crate::buffer::WritableBuffer;
    use crate::journal::JournalRecord;
    use crate::stream::Stream;

    fn hasher() -> Arc<dyn HashFunction> {
        Arc::new(ContentHasher::MERKLE)
    }

    fn config(dir: &tempfile::TempDir) -> StorageConfig {
        StorageConfig::new(dir.path().join("store.db"))
            .with_page_size(64)
            .with_max_memory(256)
    }

    #[test]
    fn create_write_commit_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let root = {
            let mut tx = open_file(&cfg, hasher()).unwrap();
            tx.write_at(0, &[4u8; 300]).unwrap();
            tx.commit().unwrap();
            tx.root()
        };
        let mut tx = open_file(&cfg, hasher()).unwrap();
        assert_eq!(tx.len(), 300);
        assert_eq!(tx.root(), root);
        assert_eq!(tx.header().commit_count, 1);
        assert_eq!(tx.read_vec(250, 50).unwrap(), vec![4u8; 50]);
        assert!(tx.verify().unwrap());
    }

    #[test]
    fn uncommitted_changes_vanish_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        {
            let mut tx = open_file(&cfg, hasher()).unwrap();
            tx.write_at(0, b"committed").unwrap();
            tx.commit().unwrap();
            tx.write_at(0, b"scribbled over").unwrap();
            // Dropped without commit: simulates a crash before commit.
        }
        let mut tx = open_file(&cfg, hasher()).unwrap();
        assert_eq!(tx.read_vec(0, tx.len() as usize).unwrap(), b"committed");
    }

    #[test]
    fn second_writer_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let _first = open_file(&cfg, hasher()).unwrap();
        let err = open_file(&cfg, hasher()).err().unwrap();
        assert!(matches!(err, StoreError::Locked(_)));
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        {
            let mut tx = open_file(&cfg, hasher()).unwrap();
            tx.write_at(0, b"data").unwrap();
            tx.commit().unwrap();
        }
        let mut ro = open_file(&cfg.clone().with_read_only(true), hasher()).unwrap();
        assert_eq!(ro.read_vec(0, 4).unwrap(), b"data");
        assert!(matches!(ro.write_at(4, b"x"), Err(StoreError::ReadOnly)));
    }

    #[test]
    fn complete_journal_is_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        {
            let mut tx = open_file(&cfg, hasher()).unwrap();
            tx.write_at(0, &[1u8; 100]).unwrap();
            tx.commit().unwrap();
        }
        // Crash after the journal was made durable but before any page
        // reached the data file.
        let record = JournalRecord {
            page_size: 64,
            visible_len: 100,
            staged_len: 140,
            pages: vec![(1, vec![2u8; 64]), (2, vec![3u8; 12])],
        };
        Journal::new(cfg.journal_path()).write(&record, true).unwrap();

        let mut tx = open_file(&cfg, hasher()).unwrap();
        assert!(!Journal::new(cfg.journal_path()).exists());
        assert_eq!(tx.len(), 140);
        let back = tx.read_vec(0, 140).unwrap();
        assert_eq!(&back[..64], &[1u8; 64]);
        assert_eq!(&back[64..128], &[2u8; 64]);
        assert_eq!(&back[128..], &[3u8; 12]);
        assert_eq!(tx.header().commit_count, 2);
        assert!(tx.verify().unwrap());
    }

    #[test]
    fn torn_journal_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        {
            let mut tx = open_file(&cfg, hasher()).unwrap();
            tx.write_at(0, b"stable").unwrap();
            tx.commit().unwrap();
        }
        fs::write(cfg.journal_path(), b"OSJOURNL\x01").unwrap();
        let mut tx = open_file(&cfg, hasher()).unwrap();
        assert!(!cfg.journal_path().exists());
        assert_eq!(tx.read_vec(0, 6).unwrap(), b"stable");
    }

    #[test]
    fn tampered_content_fails_root_check() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        {
            let mut tx = open_file(&cfg, hasher()).unwrap();
            tx.write_at(0, &[8u8; 200]).unwrap();
            tx.commit().unwrap();
        }
        {
            let mut raw = OpenOptions::new().write(true).read(true).open(&cfg.file_path).unwrap();
            raw.write_all_at(crate::header::HEADER_REGION + 70, &[0u8]).unwrap();
        }
        let err = open_file(&cfg, hasher()).err().unwrap();
        assert!(matches!(err, StoreError::RootMismatch { .. }));
    }

    #[test]
    fn header_is_readable_standalone() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        {
            let mut tx = open_file(&cfg, hasher()).unwrap();
            tx.write_at(0, b"xyz").unwrap();
            tx.commit().unwrap();
        }
        let header = read_header(&cfg.file_path).unwrap();
        assert_eq!(header.page_size, 64);
        assert_eq!(header.content_length, 3);
    }
}
