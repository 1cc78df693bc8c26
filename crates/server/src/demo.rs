use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use ricochet::net::varint;
use ricochet::{Snapshot, SnapshotDelta};

use crate::jobs::JobQueue;

const DEMO_MAGIC: &[u8; 8] = b"RKTDEMO1";

/// Records the demo/all snapshot stream: each frame is the delta against
/// the previously recorded snapshot, varint-packed. Encoding happens on
/// the tick thread; the file writes go through the job worker so disk
/// stalls never block a tick.
///
/// The recorder's delta engine registers no static sizes, so every record
/// carries an explicit size and a reader needs no wire profile.
pub struct DemoRecorder {
    writer: Arc<Mutex<BufWriter<File>>>,
    delta: SnapshotDelta,
    last: Snapshot,
}

impl DemoRecorder {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let mut file = BufWriter::new(
            File::create(path).with_context(|| format!("creating demo {}", path.display()))?,
        );
        file.write_all(DEMO_MAGIC)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(file)),
            delta: SnapshotDelta::new(),
            last: Snapshot::default(),
        })
    }

    pub fn record_snapshot(&mut self, jobs: &JobQueue, tick: i32, snapshot: &Snapshot) {
        let words = self.delta.create_delta(&self.last, snapshot);
        self.last = snapshot.clone();
        let payload = varint::compress_words(&words);

        let writer = Arc::clone(&self.writer);
        jobs.push("demo-write", move || {
            let mut guard = writer.lock().map_err(|_| anyhow!("demo writer poisoned"))?;
            guard.write_all(&tick.to_be_bytes())?;
            guard.write_all(&(payload.len() as u32).to_be_bytes())?;
            guard.write_all(&payload)?;
            Ok(())
        });
    }

    pub fn finish(&mut self, jobs: &JobQueue) {
        let writer = Arc::clone(&self.writer);
        jobs.push("demo-flush", move || {
            let mut guard = writer.lock().map_err(|_| anyhow!("demo writer poisoned"))?;
            guard.flush()?;
            Ok(())
        });
    }
}

/// Reconstructs the snapshot sequence from a demo file.
pub fn read_demo(path: &Path) -> anyhow::Result<Vec<(i32, Snapshot)>> {
    let mut file =
        File::open(path).with_context(|| format!("opening demo {}", path.display()))?;
    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != DEMO_MAGIC {
        anyhow::bail!("not a demo file");
    }

    let delta = SnapshotDelta::new();
    let mut frames = Vec::new();
    let mut current = Snapshot::default();
    loop {
        let mut header = [0u8; 8];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let tick = i32::from_be_bytes(header[..4].try_into().unwrap());
        let size = u32::from_be_bytes(header[4..].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; size];
        file.read_exact(&mut payload)?;

        let words = varint::decompress_words(&payload)?;
        current = delta.apply_delta(&current, &words)?;
        frames.push((tick, current.clone()));
    }
    Ok(frames)
}
