mod format;
mod io_adapter;
mod ops;

pub use format::mkfs_fat32;
pub use io_adapter::CacheIo;
pub use ops::{
    attrib, cp, exists, file_matches, grow_to, mkdir, mv, pwrite, rm, setlabel, touch, truncate_to,
    write_at,
};
