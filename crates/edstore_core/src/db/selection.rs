//! Logical database selection flags and their physical file mapping.

use std::fmt::{Display, Formatter};
use std::ops::{BitOr, BitOrAssign};
use std::path::{Path, PathBuf};

/// In-memory database path sentinel understood by SQLite.
pub(crate) const MEMORY_PATH: &str = ":memory:";

const PRIMARY_FILE_NAME: &str = "EDDiscovery.sqlite";
const USER_FILE_NAME: &str = "EDDUser.sqlite";
const SYSTEM_FILE_NAME: &str = "EDDSystem.sqlite";

/// Bit-flag set over the three physical store files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DbSelection(u8);

impl DbSelection {
    pub const NONE: Self = Self(0);
    pub const PRIMARY: Self = Self(1);
    pub const USER: Self = Self(2);
    pub const SYSTEM: Self = Self(4);

    /// Single-flag selections in attach order.
    pub const FLAGS: [Self; 3] = [Self::PRIMARY, Self::USER, Self::SYSTEM];

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Iterates the single flags present in this selection.
    pub fn flags(self) -> impl Iterator<Item = DbSelection> {
        Self::FLAGS
            .into_iter()
            .filter(move |flag| self.contains(*flag))
    }

    /// Schema name used when this selection is attached to a connection.
    ///
    /// Multi-flag selections resolve the same way as [`DbSelection::file_path`].
    pub fn schema_name(self) -> &'static str {
        if self.contains(Self::USER) {
            "EDDUser"
        } else if self.contains(Self::SYSTEM) {
            "EDDSystem"
        } else {
            "EDDiscovery"
        }
    }

    /// Physical path for this selection under `data_dir`.
    ///
    /// An empty selection maps to the in-memory sentinel.
    pub fn file_path(self, data_dir: &Path) -> PathBuf {
        if self.is_empty() {
            return PathBuf::from(MEMORY_PATH);
        }
        let file_name = if self.contains(Self::USER) {
            USER_FILE_NAME
        } else if self.contains(Self::SYSTEM) {
            SYSTEM_FILE_NAME
        } else {
            PRIMARY_FILE_NAME
        };
        data_dir.join(file_name)
    }

    /// Connection-string form of the physical target.
    ///
    /// Pooling is always requested; the in-memory sentinel still gets a private
    /// database per connection.
    pub fn connection_string(self, data_dir: &Path) -> String {
        format!(
            "Data Source={};Pooling=true;",
            self.file_path(data_dir).display()
        )
    }
}

impl BitOr for DbSelection {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DbSelection {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Display for DbSelection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names = self
            .flags()
            .map(|flag| match flag {
                Self::PRIMARY => "primary",
                Self::USER => "user",
                _ => "system",
            })
            .collect::<Vec<_>>();
        write!(f, "{}", names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::DbSelection;
    use std::path::{Path, PathBuf};

    #[test]
    fn empty_selection_is_in_memory() {
        let path = DbSelection::NONE.file_path(Path::new("/data"));
        assert_eq!(path, PathBuf::from(":memory:"));
        assert_eq!(
            DbSelection::NONE.connection_string(Path::new("/data")),
            "Data Source=:memory:;Pooling=true;"
        );
    }

    #[test]
    fn connection_string_names_the_backing_file() {
        let dir = Path::new("/data");
        assert_eq!(
            DbSelection::SYSTEM.connection_string(dir),
            format!("Data Source={};Pooling=true;", dir.join("EDDSystem.sqlite").display())
        );
    }

    #[test]
    fn file_path_prefers_user_then_system_then_primary() {
        let dir = Path::new("/data");
        assert_eq!(
            DbSelection::PRIMARY.file_path(dir),
            dir.join("EDDiscovery.sqlite")
        );
        assert_eq!(
            (DbSelection::PRIMARY | DbSelection::USER).file_path(dir),
            dir.join("EDDUser.sqlite")
        );
        assert_eq!(
            (DbSelection::SYSTEM | DbSelection::PRIMARY).file_path(dir),
            dir.join("EDDSystem.sqlite")
        );
    }

    #[test]
    fn flags_iterates_in_attach_order() {
        let selection = DbSelection::SYSTEM | DbSelection::PRIMARY;
        let flags = selection.flags().collect::<Vec<_>>();
        assert_eq!(flags, vec![DbSelection::PRIMARY, DbSelection::SYSTEM]);
        assert_eq!(selection.to_string(), "primary|system");
    }

    #[test]
    fn schema_names_are_stable() {
        assert_eq!(DbSelection::PRIMARY.schema_name(), "EDDiscovery");
        assert_eq!(DbSelection::USER.schema_name(), "EDDUser");
        assert_eq!(DbSelection::SYSTEM.schema_name(), "EDDSystem");
    }
}
