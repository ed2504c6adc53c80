mod ramdisk;

pub use ramdisk::RamDisk;
