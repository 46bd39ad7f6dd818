//! Instance repository

use chrono::{DateTime, Utc};
use rusqlite::Row;

use super::{DbConn, DbPool};
use crate::protocol::{Instance, InstanceId, NewInstance};
use crate::{Error, Result};

const INSTANCE_COLUMNS: &str = "id, name, description, launch_command, working_directory, created_at, updated_at, deleted_at";

/// Storage the runner's instance handlers read and write through
pub trait InstanceStore: Send + Sync {
    /// Number of live (not soft-deleted) instances
    ///
    /// # Errors
    ///
    /// Returns error if the count query fails
    fn count(&self) -> Result<i64>;

    /// One page of live instances in creation order
    ///
    /// # Errors
    ///
    /// Returns error if the page query fails
    fn find_page(&self, offset: i64, limit: i64) -> Result<Vec<Instance>>;

    /// Insert a new instance and return the stored record
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails
    fn create(&self, new: &NewInstance) -> Result<Instance>;

    /// Find a live instance by id
    ///
    /// # Errors
    ///
    /// Returns error if the lookup query fails
    fn get(&self, id: InstanceId) -> Result<Option<Instance>>;

    /// Soft-delete a live instance; it disappears from counts, pages and lookups
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstanceNotFound`] if no live instance has that id
    fn delete(&self, id: InstanceId) -> Result<()>;
}

/// `SQLite`-backed instance repository
#[derive(Clone)]
pub struct InstanceRepo {
    pool: DbPool,
}

impl InstanceRepo {
    /// Create a new instance repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }
}

impl InstanceStore for InstanceRepo {
    fn count(&self) -> Result<i64> {
        let conn = self.conn()?;
        let total = conn.query_row(
            "SELECT COUNT(*) FROM instances WHERE deleted_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    fn find_page(&self, offset: i64, limit: i64) -> Result<Vec<Instance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE deleted_at IS NULL ORDER BY id ASC LIMIT ?1 OFFSET ?2"
        ))?;

        let instances = stmt
            .query_map([limit, offset], row_to_instance)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(instances)
    }

    fn create(&self, new: &NewInstance) -> Result<Instance> {
        let conn = self.conn()?;
        let now = Utc::now();
        let stamp = now.to_rfc3339();

        conn.execute(
            "INSERT INTO instances (name, description, launch_command, working_directory, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            rusqlite::params![
                new.name,
                new.description,
                new.launch_command,
                new.working_directory,
                stamp
            ],
        )?;

        let id = conn.last_insert_rowid();
        tracing::debug!(instance_id = id, name = %new.name, "instance created");

        Ok(Instance {
            id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            name: new.name.clone(),
            description: new.description.clone(),
            launch_command: new.launch_command.clone(),
            working_directory: new.working_directory.clone(),
            is_running: false,
        })
    }

    fn get(&self, id: InstanceId) -> Result<Option<Instance>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?1 AND deleted_at IS NULL"),
            [id],
            row_to_instance,
        );

        match result {
            Ok(instance) => Ok(Some(instance)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
    fn delete(&self, id: InstanceId) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();

        let changed = conn.execute(
            "UPDATE instances SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            rusqlite::params![now, id],
        )?;

        if changed == 0 {
            return Err(Error::InstanceNotFound(id));
        }
        tracing::debug!(instance_id = id, "instance deleted");
        Ok(())
    }
}

fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<Instance> {
    Ok(Instance {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        launch_command: row.get(3)?,
        working_directory: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        updated_at: parse_datetime(&row.get::<_, String>(6)?),
        deleted_at: row
            .get::<_, Option<String>>(7)?
            .as_deref()
            .map(parse_datetime),
        is_running: false,
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
