pub use self::color::{color_ranges, CacheColoring, ColorRanges, MAX_COLOR_BITS};
pub use self::fragment::{fragments, Fragment};

mod color;
mod fragment;
