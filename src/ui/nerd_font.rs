/// Nerd font glyphs used to prefix human-readable messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NerdFont {
    // Status and feedback
    Check,
    Cross,
    Warning,
    Info,

    // Files and folders
    Folder,
    File,
    Download,
    Trash,
    Link,

    // Network and data
    Globe,
    Server,
    Search,
    Package,
    Refresh,
    Upgrade,
    Gear,
}

impl NerdFont {
    pub const fn unicode(&self) -> char {
        match self {
            Self::Check => '\u{f00c}',    // fa-check
            Self::Cross => '\u{f00d}',    // fa-times
            Self::Warning => '\u{f071}',  // fa-exclamation-triangle
            Self::Info => '\u{f05a}',     // fa-info-circle

            Self::Folder => '\u{f07b}',   // fa-folder
            Self::File => '\u{f15b}',     // fa-file
            Self::Download => '\u{f019}', // fa-download
            Self::Trash => '\u{f1f8}',    // fa-trash
            Self::Link => '\u{f0c1}',     // fa-link

            Self::Globe => '\u{f0ac}',    // fa-globe
            Self::Server => '\u{f233}',   // fa-server
            Self::Search => '\u{f002}',   // fa-search
            Self::Package => '\u{f187}',  // fa-archive (reused)
            Self::Refresh => '\u{f021}',  // fa-refresh
            Self::Upgrade => '\u{f0aa}',  // fa-arrow-circle-up
            Self::Gear => '\u{f013}',     // fa-gear
        }
    }
}

impl std::fmt::Display for NerdFont {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.unicode())
    }
}

impl From<NerdFont> for char {
    fn from(icon: NerdFont) -> Self {
        icon.unicode()
    }
}

impl From<NerdFont> for String {
    fn from(icon: NerdFont) -> Self {
        icon.unicode().to_string()
    }
}
