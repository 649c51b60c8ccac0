use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::events::TransferUpdate;
use crate::protocol::JOURNAL_FILE;
use crate::transfer::{Direction, TransferStatus};

/// One finished transfer, either direction
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub timestamp: String,
    pub job_id: Uuid,
    pub peer: IpAddr,
    pub direction: Direction,
    pub file_name: String,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub file_size: u64,
    pub error: Option<String>,
}

impl JournalEntry {
    pub fn from_update(update: &TransferUpdate) -> Self {
        let error = match &update.status {
            TransferStatus::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        Self {
            timestamp: Utc::now().to_rfc3339(),
            job_id: update.job_id,
            peer: update.peer,
            direction: update.direction,
            file_name: update.file_name.clone(),
            status: update.status.clone(),
            bytes_transferred: update.bytes,
            file_size: update.total,
            error,
        }
    }
}

/// Append-only JSONL history of terminal transfer states
pub struct TransferJournal {
    log_file_path: PathBuf,
}

impl TransferJournal {
    pub fn new(download_dir: &Path) -> Self {
        TransferJournal {
            log_file_path: download_dir.join(JOURNAL_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    /// Record `update` if it is terminal; other states are skipped
    pub fn record(&self, update: &TransferUpdate) -> Result<()> {
        if !update.status.is_terminal() {
            return Ok(());
        }
        self.add_entry(JournalEntry::from_update(update))
    }

    pub fn add_entry(&self, entry: JournalEntry) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("Failed to open transfer journal")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<JournalEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .context("Failed to open transfer journal for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(&line)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}
