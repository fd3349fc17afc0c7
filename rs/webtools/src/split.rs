//! Train / validation / test split lists.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WebToolsError};

/// Dataset split a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    /// Only training samples may have their background boxes subsampled;
    /// evaluation must see every candidate box.
    pub fn allows_background_cap(&self) -> bool {
        matches!(self, Split::Train)
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        };
        f.write_str(name)
    }
}

/// Sample identifiers of the three splits, guaranteed pairwise disjoint.
#[derive(Debug, Clone, Serialize)]
pub struct Splits {
    train: Vec<String>,
    val: Vec<String>,
    test: Vec<String>,
}

#[derive(Deserialize)]
struct SplitsFile {
    train: Vec<String>,
    val: Vec<String>,
    test: Vec<String>,
}

impl Splits {
    pub fn new(train: Vec<String>, val: Vec<String>, test: Vec<String>) -> Result<Self> {
        let splits = Self { train, val, test };
        splits.check_disjoint()?;
        Ok(splits)
    }

    /// Read `{"train": [...], "val": [...], "test": [...]}` from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| WebToolsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: SplitsFile =
            serde_json::from_str(&raw).map_err(|source| WebToolsError::Metadata {
                path: path.to_path_buf(),
                source,
            })?;
        Self::new(file.train, file.val, file.test)
    }

    pub fn ids(&self, split: Split) -> &[String] {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
        }
    }

    fn check_disjoint(&self) -> Result<()> {
        let mut seen: HashMap<&str, Split> = HashMap::new();
        for split in Split::ALL {
            for id in self.ids(split) {
                match seen.get(id.as_str()) {
                    Some(&first) if first != split => {
                        return Err(WebToolsError::SplitOverlap {
                            id: id.clone(),
                            first,
                            second: split,
                        });
                    }
                    _ => {
                        seen.insert(id, split);
                    }
                }
            }
        }
        Ok(())
    }
}
