use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, Result};

/// Output-stage polarity of one generator channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Normal,
    Inverted,
}

impl Polarity {
    /// SCPI keyword used by `OUTP<n>:POL`.
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Normal => "NORM",
            Self::Inverted => "INV",
        }
    }
}

/// The four directions exposed by the control panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Right,
    Backward,
    Left,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Forward,
        Direction::Right,
        Direction::Backward,
        Direction::Left,
    ];

    /// Mode id that the default catalog assigns to this direction.
    pub fn mode_id(self) -> u8 {
        match self {
            Self::Forward => 1,
            Self::Right => 2,
            Self::Backward => 3,
            Self::Left => 4,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Forward => "Forward",
            Self::Right => "Right",
            Self::Backward => "Backward",
            Self::Left => "Left",
        };
        f.write_str(label)
    }
}

/// One catalog entry: which files feed the channels and how each output
/// stage is polarised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mode {
    pub id: u8,
    pub name: String,
    pub channel1_file: PathBuf,
    pub channel2_file: PathBuf,
    pub channel1_polarity: Polarity,
    pub channel2_polarity: Polarity,
}

impl Mode {
    pub fn new(
        id: u8,
        name: impl Into<String>,
        files: (impl Into<PathBuf>, impl Into<PathBuf>),
        polarity: (Polarity, Polarity),
    ) -> Self {
        Self {
            id,
            name: name.into(),
            channel1_file: files.0.into(),
            channel2_file: files.1.into(),
            channel1_polarity: polarity.0,
            channel2_polarity: polarity.1,
        }
    }

    pub fn polarities(&self) -> (Polarity, Polarity) {
        (self.channel1_polarity, self.channel2_polarity)
    }

    fn resolved(mut self, base: &Path) -> Self {
        if self.channel1_file.is_relative() {
            self.channel1_file = base.join(&self.channel1_file);
        }
        if self.channel2_file.is_relative() {
            self.channel2_file = base.join(&self.channel2_file);
        }
        self
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mode {} ({})", self.id, self.name)
    }
}

const LOW_BAND: (&str, &str) = (
    "modal/25k_50k_84p88deg_2000pts.dat",
    "modal/25k_50k_264p88deg_2000pts.dat",
);
const HIGH_BAND: (&str, &str) = (
    "modal/47k_94k_57p32deg_2000pts.dat",
    "modal/47k_94k_237p32deg_2000pts.dat",
);

/// Table of the modes the generator can be switched to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeCatalog {
    modes: BTreeMap<u8, Mode>,
}

impl Default for ModeCatalog {
    fn default() -> Self {
        Self::directions()
    }
}

impl ModeCatalog {
    /// The four-direction table used with the modal test rig.
    pub fn directions() -> Self {
        Self {
            modes: Self::default_modes()
                .into_iter()
                .map(|mode| (mode.id, mode))
                .collect(),
        }
    }

    /// Entries of [`ModeCatalog::directions`] as a plain list, e.g. for a
    /// configuration file.
    pub fn default_modes() -> Vec<Mode> {
        use Polarity::{Inverted, Normal};

        vec![
            Mode::new(1, Direction::Forward.to_string(), LOW_BAND, (Normal, Inverted)),
            Mode::new(2, Direction::Right.to_string(), HIGH_BAND, (Normal, Inverted)),
            Mode::new(3, Direction::Backward.to_string(), LOW_BAND, (Inverted, Normal)),
            Mode::new(4, Direction::Left.to_string(), HIGH_BAND, (Inverted, Normal)),
        ]
    }

    /// Builds a catalog from table entries, resolving relative file paths
    /// against `data_dir`.
    pub fn from_modes(modes: Vec<Mode>, data_dir: &Path) -> Result<Self> {
        let mut table = BTreeMap::new();
        for mode in modes {
            if mode.id == 0 {
                return Err(ConfigError::Invalid("mode ids start at 1".to_string()).into());
            }
            let id = mode.id;
            if table.insert(id, mode.resolved(data_dir)).is_some() {
                return Err(ConfigError::DuplicateMode(id).into());
            }
        }
        if table.is_empty() {
            return Err(ConfigError::Invalid("mode table is empty".to_string()).into());
        }
        Ok(Self { modes: table })
    }

    pub fn lookup(&self, id: u8) -> Result<&Mode> {
        self.modes
            .get(&id)
            .ok_or_else(|| ConfigError::UnknownMode(id).into())
    }

    pub fn lookup_direction(&self, direction: Direction) -> Result<&Mode> {
        self.lookup(direction.mode_id())
    }

    /// Modes in ascending id order.
    pub fn modes(&self) -> impl Iterator<Item = &Mode> {
        self.modes.values()
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::ModalError;

    #[test]
    fn default_catalog_has_four_distinct_entries() {
        let catalog = ModeCatalog::directions();
        assert_eq!(catalog.len(), 4);

        let mut seen = HashSet::new();
        for id in 1..=4 {
            let mode = catalog.lookup(id).unwrap();
            assert_eq!(mode.id, id);
            assert_ne!(mode.channel1_file, mode.channel2_file);
            let key = (
                mode.channel1_file.clone(),
                mode.channel2_file.clone(),
                mode.polarities(),
            );
            assert!(seen.insert(key), "duplicate entry for mode {id}");
        }
    }

    #[test]
    fn directions_map_to_expected_polarity() {
        let catalog = ModeCatalog::directions();

        let forward = catalog.lookup_direction(Direction::Forward).unwrap();
        assert_eq!(forward.polarities(), (Polarity::Normal, Polarity::Inverted));
        assert_eq!(forward.name, "Forward");

        let left = catalog.lookup_direction(Direction::Left).unwrap();
        assert_eq!(left.polarities(), (Polarity::Inverted, Polarity::Normal));
        assert!(left.channel1_file.ends_with("47k_94k_57p32deg_2000pts.dat"));
    }

    #[test]
    fn unknown_mode_is_a_config_error() {
        let err = ModeCatalog::directions().lookup(99).unwrap_err();
        assert!(matches!(err, ModalError::Config(ConfigError::UnknownMode(99))));
    }

    #[test]
    fn table_entries_extend_the_catalog() {
        let mut modes = ModeCatalog::default_modes();
        modes.push(Mode::new(
            7,
            "Diagonal",
            ("a.dat", "/abs/b.dat"),
            (Polarity::Normal, Polarity::Normal),
        ));

        let catalog = ModeCatalog::from_modes(modes, Path::new("/data")).unwrap();

        let mode = catalog.lookup(7).unwrap();
        assert_eq!(mode.channel1_file, PathBuf::from("/data/a.dat"));
        assert_eq!(mode.channel2_file, PathBuf::from("/abs/b.dat"));
        assert_eq!(catalog.modes().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2, 3, 4, 7]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut modes = ModeCatalog::default_modes();
        modes.push(modes[0].clone());

        let err = ModeCatalog::from_modes(modes, Path::new(".")).unwrap_err();
        assert!(matches!(err, ModalError::Config(ConfigError::DuplicateMode(1))));
    }

    #[test]
    fn polarity_keywords() {
        assert_eq!(Polarity::Normal.keyword(), "NORM");
        assert_eq!(Polarity::Inverted.keyword(), "INV");
    }
}
