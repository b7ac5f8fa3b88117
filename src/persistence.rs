//! Binary on-disk persistence (C5): users, the rotation state header, and
//! per-day event logs. Every write goes through a `*.tmp` file followed by
//! a rename, the same atomic-write shape as the teacher's `writer_thread`
//! (`OpenOptions::new().create(true).write(true).truncate(true)` plus a
//! buffered writer), applied here per-file instead of as one long-lived
//! stream, since each save is a complete rewrite rather than an append.
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::auth::User;
use crate::error::PersistenceError;
use crate::timeseries::{Day, Event};

const USERS_MAGIC: i32 = 0x5553_4552; // "USER"
const USERS_VERSION: i32 = 1;
const STATE_MAGIC: i32 = 0x5453_5354; // "TSST"
const STATE_VERSION: i32 = 1;
const DAY_MAGIC: i32 = 0x4441_5946; // "DAYF"
const DAY_VERSION: i32 = 1;

fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

fn write_i64<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

fn write_f64<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_be_bytes())
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_i32(w, s.len() as i32)?;
    w.write_all(s.as_bytes())
}

fn write_bytes<W: Write>(w: &mut W, b: &[u8]) -> io::Result<()> {
    write_i32(w, b.len() as i32)?;
    w.write_all(b)
}

fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

fn read_f64<R: Read>(r: &mut R) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_be_bytes(buf))
}

fn read_string<R: Read>(r: &mut R) -> Result<String, PersistenceError> {
    let len = read_i32(r)?;
    if len < 0 {
        return Err(PersistenceError::CorruptFile("negative string length".into()));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| PersistenceError::CorruptFile("invalid UTF-8 string".into()))
}

fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, PersistenceError> {
    let len = read_i32(r)?;
    if len < 0 {
        return Err(PersistenceError::CorruptFile("negative byte-string length".into()));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes `bytes` to `path` via a sibling `.tmp` file and a rename, so a
/// reader never observes a half-written file.
fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut w = BufWriter::new(file);
        w.write_all(bytes)?;
        w.flush()?;
    }
    fs::rename(&tmp_path, path)
}

pub struct PersistenceStore {
    data_dir: PathBuf,
}

impl PersistenceStore {
    pub fn new(data_dir: PathBuf) -> Self {
        PersistenceStore { data_dir }
    }

    fn users_path(&self) -> PathBuf {
        self.data_dir.join("users.dat")
    }

    fn state_path(&self) -> PathBuf {
        self.data_dir.join("timeseries").join("state")
    }

    fn day_path(&self, day_id: i32) -> PathBuf {
        self.data_dir.join("timeseries").join(format!("day-{day_id}.dat"))
    }

    pub fn save_users(&self, users: &[User]) -> Result<(), PersistenceError> {
        let mut buf = Vec::new();
        write_i32(&mut buf, USERS_MAGIC)?;
        write_i32(&mut buf, USERS_VERSION)?;
        write_i32(&mut buf, users.len() as i32)?;
        for user in users {
            write_string(&mut buf, &user.username)?;
            write_bytes(&mut buf, &user.password_hash)?;
        }
        atomic_write(&self.users_path(), &buf)?;
        debug!(count = users.len(), "saved users.dat");
        Ok(())
    }

    /// Missing file is treated as an empty user set.
    pub fn load_users(&self) -> Result<Vec<User>, PersistenceError> {
        let path = self.users_path();
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut r = &bytes[..];
        let magic = read_i32(&mut r)?;
        let version = read_i32(&mut r)?;
        if magic != USERS_MAGIC || version != USERS_VERSION {
            return Err(PersistenceError::CorruptFile(format!("users.dat magic/version mismatch: {magic:#x}/{version}")));
        }
        let count = read_i32(&mut r)?;
        if count < 0 {
            return Err(PersistenceError::CorruptFile("negative user count".into()));
        }
        let mut users = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let username = read_string(&mut r)?;
            let password_hash = read_bytes(&mut r)?;
            users.push(User { username, password_hash });
        }
        Ok(users)
    }

    pub fn update_state(&self, current_day_id: i32) -> Result<(), PersistenceError> {
        let mut buf = Vec::new();
        write_i32(&mut buf, STATE_MAGIC)?;
        write_i32(&mut buf, STATE_VERSION)?;
        write_i32(&mut buf, current_day_id)?;
        atomic_write(&self.state_path(), &buf)?;
        Ok(())
    }

    /// Missing file is treated as "no prior state" (`None`): a fresh start
    /// at day 0.
    pub fn load_state(&self) -> Result<Option<i32>, PersistenceError> {
        let path = self.state_path();
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut r = &bytes[..];
        let magic = read_i32(&mut r)?;
        let version = read_i32(&mut r)?;
        if magic != STATE_MAGIC || version != STATE_VERSION {
            return Err(PersistenceError::CorruptFile(format!("state magic/version mismatch: {magic:#x}/{version}")));
        }
        let current_day_id = read_i32(&mut r)?;
        Ok(Some(current_day_id))
    }

    pub fn save_day(&self, day: &Day) -> Result<(), PersistenceError> {
        let mut buf = Vec::new();
        write_i32(&mut buf, DAY_MAGIC)?;
        write_i32(&mut buf, DAY_VERSION)?;
        write_i32(&mut buf, day.events.len() as i32)?;
        for event in &day.events {
            write_string(&mut buf, &event.product)?;
            write_i32(&mut buf, event.quantity)?;
            write_f64(&mut buf, event.price)?;
            write_i64(&mut buf, event.timestamp)?;
        }
        atomic_write(&self.day_path(day.day_id), &buf)?;
        debug!(day_id = day.day_id, events = day.events.len(), "saved day file");
        Ok(())
    }

    /// Missing file is treated as "no data for this day" (empty list),
    /// matching the store's "out-of-range or missing" contract.
    pub fn load_day(&self, day_id: i32) -> Result<Vec<Event>, PersistenceError> {
        let path = self.day_path(day_id);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut r = BufReader::new(file);
        let magic = read_i32(&mut r)?;
        let version = read_i32(&mut r)?;
        if magic != DAY_MAGIC || version != DAY_VERSION {
            return Err(PersistenceError::CorruptFile(format!("day-{day_id}.dat magic/version mismatch: {magic:#x}/{version}")));
        }
        let count = read_i32(&mut r)?;
        if count < 0 {
            return Err(PersistenceError::CorruptFile("negative event count".into()));
        }
        let mut events = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let product = read_string(&mut r)?;
            let quantity = read_i32(&mut r)?;
            let price = read_f64(&mut r)?;
            let timestamp = read_i64(&mut r)?;
            events.push(Event { product, quantity, price, timestamp });
        }
        Ok(events)
    }

    pub fn delete_day(&self, day_id: i32) -> Result<(), PersistenceError> {
        let path = self.day_path(day_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn users_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().to_path_buf());
        let users = vec![
            User { username: "alice".into(), password_hash: vec![1, 2, 3] },
            User { username: "bob".into(), password_hash: vec![4, 5, 6, 7] },
        ];
        store.save_users(&users).unwrap();
        let loaded = store.load_users().unwrap();
        assert_eq!(loaded, users);
    }

    #[test]
    fn missing_users_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().to_path_buf());
        assert!(store.load_users().unwrap().is_empty());
    }

    #[test]
    fn day_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().to_path_buf());
        let mut day = Day::new(3, 1000);
        day.events.push(Event { product: "apple".into(), quantity: 2, price: 1.5, timestamp: 1001 });
        day.events.push(Event { product: "banana".into(), quantity: 1, price: 0.5, timestamp: 1002 });
        store.save_day(&day).unwrap();
        let loaded = store.load_day(3).unwrap();
        assert_eq!(loaded, day.events);
    }

    #[test]
    fn missing_day_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().to_path_buf());
        assert!(store.load_day(42).unwrap().is_empty());
    }

    #[test]
    fn state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().to_path_buf());
        assert_eq!(store.load_state().unwrap(), None);
        store.update_state(7).unwrap();
        assert_eq!(store.load_state().unwrap(), Some(7));
    }

    #[test]
    fn corrupt_users_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().to_path_buf());
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(store.users_path(), b"not a users file").unwrap();
        assert!(matches!(store.load_users(), Err(PersistenceError::CorruptFile(_))));
    }

    #[test]
    fn delete_day_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().to_path_buf());
        store.delete_day(5).unwrap();
        let day = Day::new(5, 0);
        store.save_day(&day).unwrap();
        store.delete_day(5).unwrap();
        store.delete_day(5).unwrap();
    }
}
