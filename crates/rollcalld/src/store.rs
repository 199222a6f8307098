use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use image::GrayImage;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rollcall_core::augment::Transform;
use rollcall_core::imgops::FACE_SIZE;
use rollcall_core::{
    AttendanceMethod, AttendanceRecord, AugmentedImageSet, ClassSchedule, Punctuality,
    RecognitionModel, RecordStore, StoreError, StudentProfile,
};

const DATETIME_FMT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M:%S";
const FACE_BYTES: usize = (FACE_SIZE * FACE_SIZE) as usize;

/// SQLite-backed record store.
///
/// A single connection behind a mutex; callers run on blocking threads.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn corrupt(key: impl Into<String>, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        key: key.into(),
        reason: reason.to_string(),
    }
}

impl SqliteStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path).map_err(db)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS classes (
                 class_id TEXT PRIMARY KEY,
                 name TEXT NOT NULL,
                 days TEXT NOT NULL,
                 start_time TEXT NOT NULL,
                 end_time TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS students (
                 id TEXT PRIMARY KEY,
                 roll_number TEXT NOT NULL UNIQUE,
                 name TEXT NOT NULL,
                 class_id TEXT NOT NULL,
                 enrolled_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id);
             CREATE TABLE IF NOT EXISTS image_sets (
                 student_id TEXT PRIMARY KEY,
                 transforms TEXT NOT NULL,
                 pixels BLOB NOT NULL
             );
             CREATE TABLE IF NOT EXISTS models (
                 class_id TEXT PRIMARY KEY,
                 labels TEXT NOT NULL,
                 descriptors BLOB NOT NULL,
                 trained_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS attendance (
                 student_id TEXT NOT NULL,
                 class_id TEXT NOT NULL,
                 date TEXT NOT NULL,
                 timestamp TEXT NOT NULL,
                 confidence REAL,
                 method TEXT NOT NULL,
                 punctuality TEXT,
                 PRIMARY KEY (student_id, class_id, date)
             );",
        )
        .map_err(db)?;
        tracing::info!(path = %db_path.display(), "record store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Row decoding ─────────────────────────────────────────────────────────────

type ScheduleRow = (String, String, String, String, String);

fn schedule_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_schedule((class_id, name, days, start, end): ScheduleRow) -> Result<ClassSchedule, StoreError> {
    let days = days
        .split(',')
        .filter(|d| !d.is_empty())
        .map(|d| d.parse::<Weekday>().map_err(|_| corrupt(&class_id, format!("weekday {d:?}"))))
        .collect::<Result<Vec<_>, _>>()?;
    let start = NaiveTime::parse_from_str(&start, TIME_FMT).map_err(|e| corrupt(&class_id, e))?;
    let end = NaiveTime::parse_from_str(&end, TIME_FMT).map_err(|e| corrupt(&class_id, e))?;
    Ok(ClassSchedule {
        class_id,
        name,
        days,
        start,
        end,
    })
}

type ProfileRow = (String, String, String, String, String);

fn profile_row(row: &Row<'_>) -> rusqlite::Result<ProfileRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_profile((id, roll_number, name, class_id, enrolled_at): ProfileRow) -> Result<StudentProfile, StoreError> {
    let enrolled_at =
        NaiveDateTime::parse_from_str(&enrolled_at, DATETIME_FMT).map_err(|e| corrupt(&id, e))?;
    Ok(StudentProfile {
        id,
        roll_number,
        name,
        class_id,
        enrolled_at,
    })
}

type AttendanceRow = (String, String, String, String, Option<f64>, String, Option<String>);

fn attendance_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_attendance(
    (student_id, class_id, date, timestamp, confidence, method, punctuality): AttendanceRow,
) -> Result<AttendanceRecord, StoreError> {
    let key = format!("{student_id}/{class_id}/{date}");
    let punctuality = match punctuality {
        Some(p) => Some(Punctuality::parse(&p).ok_or_else(|| corrupt(&key, format!("punctuality {p:?}")))?),
        None => None,
    };
    Ok(AttendanceRecord {
        date: NaiveDate::parse_from_str(&date, DATE_FMT).map_err(|e| corrupt(&key, e))?,
        timestamp: NaiveDateTime::parse_from_str(&timestamp, DATETIME_FMT)
            .map_err(|e| corrupt(&key, e))?,
        confidence: confidence.map(|c| c as f32),
        method: AttendanceMethod::parse(&method)
            .ok_or_else(|| corrupt(&key, format!("method {method:?}")))?,
        punctuality,
        student_id,
        class_id,
    })
}

// ── Blob encoding ────────────────────────────────────────────────────────────

fn floats_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_floats(key: &str, bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(corrupt(key, format!("descriptor blob of {} bytes", bytes.len())));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn decode_image_set(key: &str, transforms: &str, pixels: Vec<u8>) -> Result<AugmentedImageSet, StoreError> {
    let transforms: Vec<Transform> = serde_json::from_str(transforms).map_err(|e| corrupt(key, e))?;
    if pixels.len() != transforms.len() * FACE_BYTES {
        return Err(corrupt(
            key,
            format!("{} pixel bytes for {} images", pixels.len(), transforms.len()),
        ));
    }
    let images = pixels
        .chunks_exact(FACE_BYTES)
        .map(|c| GrayImage::from_raw(FACE_SIZE, FACE_SIZE, c.to_vec()))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| corrupt(key, "image buffer"))?;
    AugmentedImageSet::from_parts(transforms, images).ok_or_else(|| corrupt(key, "length mismatch"))
}

const SCHEDULE_COLS: &str = "class_id, name, days, start_time, end_time";
const PROFILE_COLS: &str = "id, roll_number, name, class_id, enrolled_at";
const ATTENDANCE_COLS: &str =
    "student_id, class_id, date, timestamp, confidence, method, punctuality";

impl RecordStore for SqliteStore {
    fn schedule(&self, class_id: &str) -> Result<Option<ClassSchedule>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {SCHEDULE_COLS} FROM classes WHERE class_id = ?1"),
                [class_id],
                schedule_row,
            )
            .optional()
            .map_err(db)?;
        row.map(decode_schedule).transpose()
    }

    fn schedules(&self) -> Result<Vec<ClassSchedule>, StoreError> {
        let rows: Vec<ScheduleRow> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare(&format!("SELECT {SCHEDULE_COLS} FROM classes ORDER BY class_id"))
                .map_err(db)?;
            let rows = stmt.query_map([], schedule_row).map_err(db)?;
            rows.collect::<Result<_, _>>().map_err(db)?
        };
        rows.into_iter().map(decode_schedule).collect()
    }

    fn put_schedule(&self, schedule: &ClassSchedule) -> Result<(), StoreError> {
        let days: Vec<String> = schedule.days.iter().map(|d| d.to_string()).collect();
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO classes (class_id, name, days, start_time, end_time)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    schedule.class_id,
                    schedule.name,
                    days.join(","),
                    schedule.start.format(TIME_FMT).to_string(),
                    schedule.end.format(TIME_FMT).to_string(),
                ],
            )
            .map_err(db)?;
        Ok(())
    }

    fn remove_schedule(&self, class_id: &str) -> Result<bool, StoreError> {
        let affected = self
            .conn()
            .execute("DELETE FROM classes WHERE class_id = ?1", [class_id])
            .map_err(db)?;
        Ok(affected > 0)
    }

    fn profile(&self, student_id: &str) -> Result<Option<StudentProfile>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {PROFILE_COLS} FROM students WHERE id = ?1"),
                [student_id],
                profile_row,
            )
            .optional()
            .map_err(db)?;
        row.map(decode_profile).transpose()
    }

    fn profile_by_roll(&self, roll_number: &str) -> Result<Option<StudentProfile>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {PROFILE_COLS} FROM students WHERE roll_number = ?1"),
                [roll_number],
                profile_row,
            )
            .optional()
            .map_err(db)?;
        row.map(decode_profile).transpose()
    }

    fn roster(&self, class_id: &str) -> Result<Vec<StudentProfile>, StoreError> {
        let rows: Vec<ProfileRow> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {PROFILE_COLS} FROM students WHERE class_id = ?1 ORDER BY roll_number"
                ))
                .map_err(db)?;
            let rows = stmt.query_map([class_id], profile_row).map_err(db)?;
            rows.collect::<Result<_, _>>().map_err(db)?
        };
        rows.into_iter().map(decode_profile).collect()
    }

    fn students(&self) -> Result<Vec<StudentProfile>, StoreError> {
        let rows: Vec<ProfileRow> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare(&format!("SELECT {PROFILE_COLS} FROM students ORDER BY roll_number"))
                .map_err(db)?;
            let rows = stmt.query_map([], profile_row).map_err(db)?;
            rows.collect::<Result<_, _>>().map_err(db)?
        };
        rows.into_iter().map(decode_profile).collect()
    }

    fn put_profile(&self, profile: &StudentProfile) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO students (id, roll_number, name, class_id, enrolled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    profile.id,
                    profile.roll_number,
                    profile.name,
                    profile.class_id,
                    profile.enrolled_at.format(DATETIME_FMT).to_string(),
                ],
            )
            .map_err(db)?;
        Ok(())
    }

    fn remove_profile(&self, student_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn();
        conn.execute("DELETE FROM image_sets WHERE student_id = ?1", [student_id])
            .map_err(db)?;
        let affected = conn
            .execute("DELETE FROM students WHERE id = ?1", [student_id])
            .map_err(db)?;
        Ok(affected > 0)
    }

    fn image_set(&self, student_id: &str) -> Result<Option<AugmentedImageSet>, StoreError> {
        let row: Option<(String, Vec<u8>)> = self
            .conn()
            .query_row(
                "SELECT transforms, pixels FROM image_sets WHERE student_id = ?1",
                [student_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db)?;
        row.map(|(t, p)| decode_image_set(student_id, &t, p)).transpose()
    }

    fn put_image_set(&self, student_id: &str, set: &AugmentedImageSet) -> Result<(), StoreError> {
        let transforms =
            serde_json::to_string(set.transforms()).map_err(|e| corrupt(student_id, e))?;
        let mut pixels = Vec::with_capacity(set.len() * FACE_BYTES);
        for img in set.images() {
            pixels.extend_from_slice(img.as_raw());
        }
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO image_sets (student_id, transforms, pixels) VALUES (?1, ?2, ?3)",
                params![student_id, transforms, pixels],
            )
            .map_err(db)?;
        Ok(())
    }

    fn model(&self, class_id: &str) -> Result<Option<RecognitionModel>, StoreError> {
        let row: Option<(String, Vec<u8>, String)> = self
            .conn()
            .query_row(
                "SELECT labels, descriptors, trained_at FROM models WHERE class_id = ?1",
                [class_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(db)?;
        let Some((labels, blob, trained_at)) = row else {
            return Ok(None);
        };
        let labels: Vec<String> = serde_json::from_str(&labels).map_err(|e| corrupt(class_id, e))?;
        let descriptors = bytes_to_floats(class_id, &blob)?;
        let trained_at =
            NaiveDateTime::parse_from_str(&trained_at, DATETIME_FMT).map_err(|e| corrupt(class_id, e))?;
        RecognitionModel::from_parts(labels, descriptors, trained_at)
            .map(Some)
            .map_err(|e| corrupt(class_id, e))
    }

    fn put_model(&self, class_id: &str, model: &RecognitionModel) -> Result<(), StoreError> {
        let labels = serde_json::to_string(model.labels()).map_err(|e| corrupt(class_id, e))?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO models (class_id, labels, descriptors, trained_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    class_id,
                    labels,
                    floats_to_bytes(model.descriptors()),
                    model.trained_at().format(DATETIME_FMT).to_string(),
                ],
            )
            .map_err(db)?;
        Ok(())
    }

    fn remove_model(&self, class_id: &str) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM models WHERE class_id = ?1", [class_id])
            .map_err(db)?;
        Ok(())
    }

    fn attendance(
        &self,
        student_id: &str,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {ATTENDANCE_COLS} FROM attendance
                     WHERE student_id = ?1 AND class_id = ?2 AND date = ?3"
                ),
                params![student_id, class_id, date.format(DATE_FMT).to_string()],
                attendance_row,
            )
            .optional()
            .map_err(db)?;
        row.map(decode_attendance).transpose()
    }

    fn put_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO attendance ({ATTENDANCE_COLS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    record.student_id,
                    record.class_id,
                    record.date.format(DATE_FMT).to_string(),
                    record.timestamp.format(DATETIME_FMT).to_string(),
                    record.confidence.map(f64::from),
                    record.method.as_str(),
                    record.punctuality.map(|p| p.as_str()),
                ],
            )
            .map_err(db)?;
        Ok(())
    }

    fn attendance_for_class(
        &self,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let rows: Vec<AttendanceRow> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ATTENDANCE_COLS} FROM attendance
                     WHERE class_id = ?1 AND date = ?2 ORDER BY timestamp"
                ))
                .map_err(db)?;
            let rows = stmt
                .query_map(params![class_id, date.format(DATE_FMT).to_string()], attendance_row)
                .map_err(db)?;
            rows.collect::<Result<_, _>>().map_err(db)?
        };
        rows.into_iter().map(decode_attendance).collect()
    }

    fn attendance_between(
        &self,
        class_id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let rows: Vec<AttendanceRow> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ATTENDANCE_COLS} FROM attendance
                     WHERE date BETWEEN ?1 AND ?2 AND (?3 IS NULL OR class_id = ?3)
                     ORDER BY date, class_id, timestamp"
                ))
                .map_err(db)?;
            let rows = stmt
                .query_map(
                    params![
                        from.format(DATE_FMT).to_string(),
                        to.format(DATE_FMT).to_string(),
                        class_id,
                    ],
                    attendance_row,
                )
                .map_err(db)?;
            rows.collect::<Result<_, _>>().map_err(db)?
        };
        rows.into_iter().map(decode_attendance).collect()
    }
}
