//! # List Options
//!
//! Sort target and order for `list` operations. The target picks the
//! column the scan is keyed on; the order picks the direction. `None`
//! lets the adapter use whatever deterministic order is cheapest, which
//! for these tables is primary-key order.

// =============================================================================
// Sort Target
// =============================================================================

/// The column a `list` scan is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortTarget {
    /// Order by the row key (lexicographic).
    Key,
    /// Order by the revision assigned when the row was created.
    ///
    /// Rows created in one transaction still get distinct revisions, so
    /// this order is total and reproduces creation order exactly.
    CreatedRev,
    /// Order by the revision of the most recent write to the row.
    UpdatedRev,
}

// =============================================================================
// Sort Order
// =============================================================================

/// The direction of a `list` scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Smallest first.
    Ascend,
    /// Largest first.
    Descend,
    /// No requested order; the adapter picks a deterministic one.
    None,
}

// =============================================================================
// Options
// =============================================================================

/// Options for `list` operations.
///
/// The default is key-ascending, so bare `list` calls iterate in a
/// stable, reproducible order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Column to order by.
    pub target: SortTarget,
    /// Scan direction.
    pub order: SortOrder,
}

impl Options {
    /// Key-ascending options, the same as `Options::default()`.
    pub fn default_options() -> Self {
        Self::default()
    }

    /// Options sorted by creation revision.
    pub fn by_created_rev(order: SortOrder) -> Self {
        Options {
            target: SortTarget::CreatedRev,
            order,
        }
    }

    /// Options sorted by last-write revision.
    pub fn by_updated_rev(order: SortOrder) -> Self {
        Options {
            target: SortTarget::UpdatedRev,
            order,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            target: SortTarget::Key,
            order: SortOrder::Ascend,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
