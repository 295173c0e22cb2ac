//! SQLite-backed task source, inventory and result sink.

use std::path::Path;

use rusqlite::{Connection, params};
use tracing::debug;

use super::{CandidateExe, InventoryLookup, ResultRow, ResultSink, StoreResult, TaskSource};
use crate::task::{Task, TaskResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    machine_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    package_name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS software (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS executables (
    file_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    path TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS unit_test (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    image TEXT NOT NULL,
    test_name TEXT NOT NULL,
    result INTEGER NOT NULL,
    message TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS unit_test_image_task ON unit_test(image, task_id);
";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) a database file and make sure the schema exists
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self {
            conn: Connection::open(path)?,
        };
        store.init_schema()?;
        debug!(path = %path.display(), "opened sqlite store");
        Ok(store)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn init_schema(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn add_task(&self, machine_id: &str, task_id: &str, package_name: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO tasks (machine_id, task_id, package_name) VALUES (?1, ?2, ?3)",
            params![machine_id, task_id, package_name],
        )?;
        Ok(())
    }

    pub fn add_software(&self, task_id: &str, title: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO software (task_id, title) VALUES (?1, ?2)",
            params![task_id, title],
        )?;
        Ok(())
    }

    pub fn add_executable(&self, task_id: &str, file_id: &str, path: &str) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO executables (file_id, task_id, path) VALUES (?1, ?2, ?3)",
            params![file_id, task_id, path],
        )?;
        Ok(())
    }

    /// Stored result rows for one task, in insertion order
    pub fn results_for(&self, image: &str, task_id: &str) -> StoreResult<Vec<ResultRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, image, test_name, result, message FROM unit_test
             WHERE image = ?1 AND task_id = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![image, task_id], |r| {
            Ok(ResultRow {
                task_id: r.get(0)?,
                image: r.get(1)?,
                test_name: r.get(2)?,
                result: r.get(3)?,
                message: r.get(4)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl TaskSource for SqliteStore {
    fn load_tasks(&self, machine_id: &str) -> StoreResult<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare("SELECT task_id, package_name FROM tasks WHERE machine_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![machine_id], |r| {
            Ok(Task::new(r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }
}

impl InventoryLookup for SqliteStore {
    fn entry_exists(&self, task_id: &str) -> StoreResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM software WHERE task_id = ?1",
            params![task_id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    fn candidate_executables(&self, task_id: &str) -> StoreResult<Vec<CandidateExe>> {
        let mut stmt = self
            .conn
            .prepare("SELECT file_id, path FROM executables WHERE task_id = ?1 ORDER BY rowid")?;
        let rows = stmt.query_map(params![task_id], |r| {
            Ok(CandidateExe {
                file_id: r.get(0)?,
                path: r.get(1)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl ResultSink for SqliteStore {
    fn replace_results(&mut self, image: &str, task_id: &str, results: &[TaskResult]) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM unit_test WHERE image = ?1 AND task_id = ?2",
            params![image, task_id],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO unit_test (task_id, image, test_name, result, message)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for result in results {
                insert.execute(params![task_id, image, result.name, result.code(), result.message])?;
            }
        }
        tx.commit()?;
        debug!(task_id, rows = results.len(), "results stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::names;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tasks_load_in_insertion_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add_task("PC-7", "900", "Zeta").unwrap();
        store.add_task("PC-7", "100", "Alpha").unwrap();
        store.add_task("PC-8", "555", "Other").unwrap();

        let tasks = store.load_tasks("PC-7").unwrap();
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["900", "100"]);
        assert_eq!(tasks[1].name, "Alpha");
    }

    #[test]
    fn test_inventory_queries() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add_software("100", "Alpha 1.0").unwrap();
        store.add_executable("100", "f1", r"C:\Alpha\alpha.exe").unwrap();

        assert!(store.entry_exists("100").unwrap());
        assert!(!store.entry_exists("200").unwrap());
        assert_eq!(
            store.candidate_executables("100").unwrap(),
            vec![CandidateExe {
                file_id: "f1".to_string(),
                path: r"C:\Alpha\alpha.exe".to_string(),
            }]
        );
        assert!(store.candidate_executables("200").unwrap().is_empty());
    }

    #[test]
    fn test_replace_results_is_idempotent() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let results = vec![
            TaskResult::pass(names::ENTRY_EXISTS, ""),
            TaskResult::fail(names::TASK_AVAILABLE, "Policy file not found"),
        ];

        store.replace_results("win10", "100", &results).unwrap();
        store.replace_results("win10", "100", &results).unwrap();

        let rows = store.results_for("win10", "100").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].test_name, names::TASK_AVAILABLE);
        assert_eq!(rows[1].result, 0);
    }

    #[test]
    fn test_replace_leaves_other_images_alone() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .replace_results("win7", "100", &[TaskResult::pass(names::ENTRY_EXISTS, "")])
            .unwrap();
        store.replace_results("win10", "100", &[]).unwrap();
        assert_eq!(store.results_for("win7", "100").unwrap().len(), 1);
    }
}
