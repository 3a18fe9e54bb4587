/*!
 * Data Structures
 *
 * - Inline strings for allocation names and error reasons
 * - Generational slot table backing allocation handles
 */

mod inline_string;
mod slot_table;

pub use inline_string::InlineString;
pub use slot_table::{SlotKey, SlotTable};
