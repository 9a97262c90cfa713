use crate::{error::StorageError, types::StorageRegion};

/// Two-slot firmware storage with a single boot pointer.
pub trait FirmwareStorage: Send + Sync {
    /// Region the running image was loaded from.
    fn booted_region(&self) -> Option<StorageRegion>;

    /// Region the boot pointer selects for the next restart.
    fn boot_region(&self) -> Option<StorageRegion>;

    /// The region that is not currently booted. Stable until the next restart.
    fn inactive_region(&self) -> Option<StorageRegion>;

    /// Erases enough of `region` for `size` bytes and returns a sequential writer.
    fn open(&self, region: &StorageRegion, size: u32)
        -> Result<Box<dyn RegionWriter>, StorageError>;

    fn set_boot_region(&self, region: &StorageRegion) -> Result<(), StorageError>;
}

/// Sequential writer into one region. Dropping without `finalize` must leave the
/// boot pointer untouched.
pub trait RegionWriter: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Validates the written image. Does not switch the boot pointer.
    fn finalize(self: Box<Self>) -> Result<(), StorageError>;

    fn abort(self: Box<Self>);
}
