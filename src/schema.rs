//! Schema and lifecycle
//!
//! Table creation, the default spaces, the destructive test-only wipe,
//! and the backup-before-recreate rename. The table shapes here are the
//! authoritative ones; the store and load paths are kept in sync with
//! them by hand.

use crate::error::Result;
use crate::response::Response;
use crate::storage::{AtomStorage, StorageInner};
use std::sync::atomic::Ordering;

const CREATE_SPACES: &str = "CREATE TABLE Spaces (\
     space BIGINT PRIMARY KEY,\
     parent BIGINT);";

const CREATE_ATOMS: &str = "CREATE TABLE Atoms (\
     uuid BIGINT PRIMARY KEY,\
     space BIGINT REFERENCES Spaces(space),\
     type SMALLINT,\
     tv_type SMALLINT,\
     stv_mean FLOAT,\
     stv_confidence FLOAT,\
     stv_count DOUBLE PRECISION,\
     height SMALLINT,\
     name TEXT,\
     outgoing BIGINT[],\
     UNIQUE (type, name),\
     UNIQUE (type, outgoing));";

const CREATE_VALUATIONS: &str = "CREATE TABLE Valuations (\
     key BIGINT REFERENCES Atoms(uuid),\
     atom BIGINT REFERENCES Atoms(uuid),\
     type SMALLINT,\
     floatvalue DOUBLE PRECISION[],\
     stringvalue TEXT[],\
     linkvalue BIGINT[],\
     UNIQUE (key, atom));";

const CREATE_VALUES: &str = "CREATE TABLE Values (\
     vuid BIGINT PRIMARY KEY,\
     type SMALLINT,\
     floatvalue DOUBLE PRECISION[],\
     stringvalue TEXT[],\
     linkvalue BIGINT[]);";

const CREATE_TYPECODES: &str = "CREATE TABLE TypeCodes (\
     type SMALLINT UNIQUE,\
     typename TEXT UNIQUE);";

impl StorageInner {
    pub(crate) fn create_tables(&self) -> Result<()> {
        let mut rp = Response::new(&self.pool);

        rp.exec(CREATE_SPACES)?;
        rp.exec("INSERT INTO Spaces VALUES (0,0);")?;
        rp.exec("INSERT INTO Spaces VALUES (1,1);")?;

        rp.exec(CREATE_ATOMS)?;
        rp.exec(CREATE_VALUATIONS)?;
        rp.exec("CREATE INDEX ON Valuations (atom);")?;
        rp.exec(CREATE_VALUES)?;
        rp.exec(CREATE_TYPECODES)?;

        // The type map must be rebuilt against the fresh TypeCodes table.
        self.typemap_loaded.store(false, Ordering::Release);
        self.reset_id_caches();
        Ok(())
    }

    /// Wipe all data. Test-only; the type codes survive, the atoms,
    /// values, valuations and spaces do not.
    pub(crate) fn kill_data(&self) -> Result<()> {
        let mut rp = Response::new(&self.pool);

        rp.exec("DELETE from Valuations;")?;
        rp.exec("DELETE from Values;")?;
        rp.exec("DELETE from Atoms;")?;
        rp.exec("DELETE from Spaces;")?;

        rp.exec("INSERT INTO Spaces VALUES (0,0);")?;
        rp.exec("INSERT INTO Spaces VALUES (1,1);")?;

        self.reset_id_caches();
        Ok(())
    }

    /// Move the live tables aside as backups so a fresh schema can be
    /// created without losing the old data.
    pub(crate) fn rename_tables(&self) -> Result<()> {
        let mut rp = Response::new(&self.pool);

        rp.exec("ALTER TABLE Atoms RENAME TO Atoms_Backup;")?;
        rp.exec("ALTER TABLE Valuations RENAME TO Valuations_Backup;")?;
        rp.exec("ALTER TABLE Values RENAME TO Values_Backup;")?;
        rp.exec("ALTER TABLE TypeCodes RENAME TO TypeCodes_Backup;")
    }
}

impl AtomStorage {
    /// Create the tables on a fresh database, with the two default spaces
    pub fn create_tables(&self) -> Result<()> {
        self.inner().create_tables()
    }

    /// Destroy all data in the database. Dangerous; meant for test cases.
    pub fn kill_data(&self) -> Result<()> {
        self.inner().kill_data()
    }

    /// Rename the live tables to `*_Backup`
    pub fn rename_tables(&self) -> Result<()> {
        self.inner().rename_tables()
    }
}
