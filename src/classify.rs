use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Internal classification of a scan, derived from its raw type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Localizer,
    NonImage,
    Pd,
    T2,
    Dwi,
    T1,
    Generic,
}

impl Category {
    /// Localizers and non-image series are never downloaded.
    pub fn is_excluded(self) -> bool {
        matches!(self, Category::Localizer | Category::NonImage)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Localizer => "localizer",
            Category::NonImage => "non-image",
            Category::Pd => "PD",
            Category::T2 => "T2",
            Category::Dwi => "DWI",
            Category::T1 => "T1",
            Category::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// Map a raw archive scan type to a category.
///
/// Exclusions are checked first. `T2` is never returned here; it only exists as
/// the second half of a split PD series.
pub fn categorize(raw_type: &str) -> Category {
    if raw_type.contains("localizer") {
        Category::Localizer
    } else if raw_type.contains("nonImageDicom") {
        Category::NonImage
    } else if raw_type.contains("DWI") {
        Category::Dwi
    } else if raw_type.starts_with("T1") {
        Category::T1
    } else if raw_type.contains("PD") {
        Category::Pd
    } else {
        Category::Generic
    }
}

/// Approved raw scan types. Membership is an exact string match.
#[derive(Debug, Clone, Default)]
pub struct WhiteList {
    types: HashSet<String>,
}

impl WhiteList {
    pub fn load(path: &Path) -> io::Result<WhiteList> {
        let content = fs::read_to_string(path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Error reading whitelist {}: {}", path.display(), e),
            )
        })?;
        Ok(WhiteList::parse(&content))
    }

    pub fn parse(content: &str) -> WhiteList {
        let types = content
            .lines()
            .map(|line| line.trim_end_matches(['\r', '\n']))
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        WhiteList { types }
    }

    pub fn contains(&self, raw_type: &str) -> bool {
        self.types.contains(raw_type)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for WhiteList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        WhiteList {
            types: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Why a scan was dropped before download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Excluded(Category),
    NotWhitelisted,
}

/// Category decision plus whitelist filter, in that order.
pub fn classify(raw_type: &str, whitelist: &WhiteList) -> Result<Category, Rejection> {
    let category = categorize(raw_type);
    if category.is_excluded() {
        return Err(Rejection::Excluded(category));
    }
    if !whitelist.contains(raw_type) {
        return Err(Rejection::NotWhitelisted);
    }
    Ok(category)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize() {
        assert_eq!(categorize("localizer"), Category::Localizer);
        assert_eq!(categorize("3-plane localizer"), Category::Localizer);
        assert_eq!(categorize("nonImageDicom"), Category::NonImage);
        assert_eq!(categorize("DWI-32"), Category::Dwi);
        assert_eq!(categorize("T1-15"), Category::T1);
        assert_eq!(categorize("PD-T2-30"), Category::Pd);
        assert_eq!(categorize("T2-30"), Category::Generic);
        assert_eq!(categorize("FLAIR"), Category::Generic);
    }

    #[test]
    fn test_exclusion_wins_over_other_patterns() {
        // A localizer never reaches the DWI/T1 checks.
        assert_eq!(categorize("DWI localizer"), Category::Localizer);
    }

    #[test]
    fn test_t1_must_be_prefix() {
        assert_eq!(categorize("MPRAGE T1"), Category::Generic);
    }

    #[test]
    fn test_whitelist_parse_strips_crlf() {
        let list = WhiteList::parse("T1-15\r\nDWI\r\n\nPD-T2-30\n");
        assert_eq!(list.len(), 3);
        assert!(list.contains("T1-15"));
        assert!(list.contains("DWI"));
        assert!(!list.contains(""));
        assert!(!list.contains("T1"));
    }

    #[test]
    fn test_classify_checks_exclusion_before_whitelist() {
        let list: WhiteList = ["localizer", "T1-15"].into_iter().collect();
        assert_eq!(
            classify("localizer", &list),
            Err(Rejection::Excluded(Category::Localizer))
        );
        assert_eq!(classify("T1-15", &list), Ok(Category::T1));
        assert_eq!(classify("T1-30", &list), Err(Rejection::NotWhitelisted));
    }
}
