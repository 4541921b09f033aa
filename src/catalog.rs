use std::fmt;

use crate::errors::MarketError;

/// One of the fixed catalog of goods traded on the market.
///
/// The catalog is process-wide and not extensible at runtime. Wire messages
/// carry the lowercase name; parsing is case-insensitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemKind {
    /// Flowers.
    Flower,
    /// Sugar.
    Sugar,
    /// Potatoes.
    Potato,
    /// Oil.
    Oil,
}

impl ItemKind {
    /// Every catalog item, in a fixed order. Used to seed seller ledgers.
    pub const ALL: [ItemKind; 4] = [
        ItemKind::Flower,
        ItemKind::Sugar,
        ItemKind::Potato,
        ItemKind::Oil,
    ];

    /// The canonical lowercase name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ItemKind::Flower => "flower",
            ItemKind::Sugar => "sugar",
            ItemKind::Potato => "potato",
            ItemKind::Oil => "oil",
        }
    }

    /// Parses an item name, case-insensitively.
    ///
    /// Anything outside the catalog is rejected with
    /// [`MarketError::UnknownItem`].
    pub fn parse(name: &str) -> Result<Self, MarketError> {
        match name.to_ascii_lowercase().as_str() {
            "flower" => Ok(ItemKind::Flower),
            "sugar" => Ok(ItemKind::Sugar),
            "potato" => Ok(ItemKind::Potato),
            "oil" => Ok(ItemKind::Oil),
            _ => Err(MarketError::UnknownItem(name.to_string())),
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_any_case() {
        assert_eq!(ItemKind::parse("flower").unwrap(), ItemKind::Flower);
        assert_eq!(ItemKind::parse("SUGAR").unwrap(), ItemKind::Sugar);
        assert_eq!(ItemKind::parse("Potato").unwrap(), ItemKind::Potato);
        assert_eq!(ItemKind::parse("oIL").unwrap(), ItemKind::Oil);
    }

    #[test]
    fn test_parse_rejects_unknown_names() {
        let err = ItemKind::parse("gold").unwrap_err();
        assert!(matches!(err, MarketError::UnknownItem(name) if name == "gold"));
    }

    #[test]
    fn test_catalog_is_complete() {
        assert_eq!(ItemKind::ALL.len(), 4);
        for item in ItemKind::ALL {
            assert_eq!(ItemKind::parse(item.name()).unwrap(), item);
        }
    }
}
