use crate::device::DeviceSession;
use crate::error::{Result, WalletError};
use crate::types::{DerivationPath, DerivedAddress, HARDENED};
use std::sync::Arc;
use tracing::info;

/// Pages through addresses under the session's derivation prefix.
pub struct AddressEnumerator {
    session: Arc<DeviceSession>,
    confirm_on_device: bool,
}

impl AddressEnumerator {
    pub fn new(session: Arc<DeviceSession>, confirm_on_device: bool) -> Self {
        Self {
            session,
            confirm_on_device,
        }
    }

    /// Addresses for indices `[(page - 1) * page_size, page * page_size)`, in
    /// index order. One failed derivation fails the whole page. The whole range
    /// must fit below the hardened bit before the device is asked for anything.
    pub async fn enumerate(&self, page: u32, page_size: u32) -> Result<Vec<DerivedAddress>> {
        let invalid = || WalletError::InvalidPage { page, page_size };
        if page == 0 || page_size == 0 {
            return Err(invalid());
        }
        let end = page.checked_mul(page_size).ok_or_else(invalid)?;
        if end > HARDENED {
            return Err(invalid());
        }
        let start = end - page_size;

        info!("Deriving page {} ({} addresses from index {})", page, page_size, start);
        let mut addresses = Vec::new();
        for index in start..end {
            addresses.push(self.derive_one(index).await?);
        }
        Ok(addresses)
    }

    pub async fn derive_one(&self, index: u32) -> Result<DerivedAddress> {
        let path = DerivationPath::for_index(self.session.coin_type(), index)?;
        let address = self.session.derive_address(&path, self.confirm_on_device).await?;
        Ok(DerivedAddress { address, path, index })
    }
}
