use super::filters::{Action, Condition, FilterEngine, FilterId, FilterSpec, Layer, TransactionToken};
use crate::error::{Error, Result};
use crate::image_set::ImageName;
use std::net::IpAddr;

/// An in-tunnel block-filter pair (outbound+inbound) for one image, per
/// address family.
#[derive(Debug, Clone)]
pub struct AppFilterEntry {
    pub image: ImageName,
    pub refcount: u32,
    pub outbound_v4: Option<FilterId>,
    pub inbound_v4: Option<FilterId>,
    pub outbound_v6: Option<FilterId>,
    pub inbound_v6: Option<FilterId>,
}

impl AppFilterEntry {
    fn filter_ids(&self) -> impl Iterator<Item = FilterId> {
        [self.outbound_v4, self.inbound_v4, self.outbound_v6, self.inbound_v6]
            .into_iter()
            .flatten()
    }
}

/// A reversible operation recorded in the transaction log, inverted on
/// abort. Mirrors the push/invert scheme of the original transaction log:
/// increments undo as decrements, additions undo as removals (and vice
/// versa), and a full-list swap restores the prior list.
enum TxnEvent {
    Incremented(ImageName),
    Decremented(ImageName),
    Added(ImageName),
    Removed { entry: AppFilterEntry, index: usize },
    ListSwapped(Vec<AppFilterEntry>),
}

/// Manages per-image block-tunnel filter pairs with reference counting and
/// a local transaction log, composed inside the outer framework transaction
/// the firewall coordinator provides.
pub struct AppFilters<E: FilterEngine> {
    entries: Vec<AppFilterEntry>,
    log: Option<Vec<TxnEvent>>,
    _engine: std::marker::PhantomData<fn() -> E>,
}

impl<E: FilterEngine> Default for AppFilters<E> {
    fn default() -> Self {
        AppFilters {
            entries: Vec::new(),
            log: None,
            _engine: std::marker::PhantomData,
        }
    }
}

impl<E: FilterEngine> AppFilters<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.log.is_some() {
            return Err(Error::StateMismatch);
        }
        self.log = Some(Vec::new());
        Ok(())
    }

    pub fn commit(&mut self) {
        self.log = None;
    }

    pub fn abort(&mut self, engine: &E, token: TransactionToken) -> Result<()> {
        let log = self.log.take().ok_or(Error::StateMismatch)?;
        for event in log.into_iter().rev() {
            match event {
                TxnEvent::Incremented(image) => {
                    if let Some(entry) = self.find_mut(&image) {
                        entry.refcount -= 1;
                    }
                }
                TxnEvent::Decremented(image) => {
                    if let Some(entry) = self.find_mut(&image) {
                        entry.refcount += 1;
                    }
                }
                TxnEvent::Added(image) => {
                    if let Some(pos) = self.entries.iter().position(|e| e.image == image) {
                        let entry = self.entries.remove(pos);
                        for id in entry.filter_ids() {
                            let _ = engine.remove_filter(token, id);
                        }
                    }
                }
                TxnEvent::Removed { entry, index } => {
                    let index = index.min(self.entries.len());
                    self.entries.insert(index, entry);
                }
                TxnEvent::ListSwapped(previous) => {
                    self.entries = previous;
                }
            }
        }
        Ok(())
    }

    fn find_mut(&mut self, image: &ImageName) -> Option<&mut AppFilterEntry> {
        self.entries.iter_mut().find(|e| &e.image == image)
    }

    fn record(&mut self, event: TxnEvent) {
        if let Some(log) = self.log.as_mut() {
            log.push(event);
        }
    }

    /// Looks up `image`; if found, increments its reference count. Otherwise
    /// installs block filters for every family with a usable tunnel address
    /// and appends a new entry.
    pub fn register_block(
        &mut self,
        engine: &E,
        token: TransactionToken,
        image: &ImageName,
        tunnel_v4: Option<IpAddr>,
        tunnel_v6: Option<IpAddr>,
        provider_context: u64,
    ) -> Result<()> {
        if let Some(entry) = self.find_mut(image) {
            entry.refcount += 1;
            self.record(TxnEvent::Incremented(image.clone()));
            return Ok(());
        }

        let blob = app_identifier_blob(image);

        let mut entry = AppFilterEntry {
            image: image.clone(),
            refcount: 1,
            outbound_v4: None,
            inbound_v4: None,
            outbound_v6: None,
            inbound_v6: None,
        };

        if let Some(addr) = tunnel_v4 {
            entry.outbound_v4 = Some(install_block(engine, token, Layer::AuthConnectV4, &blob, addr, provider_context)?);
            entry.inbound_v4 = Some(install_block(engine, token, Layer::AuthRecvAcceptV4, &blob, addr, provider_context)?);
        }
        if let Some(addr) = tunnel_v6 {
            entry.outbound_v6 = Some(install_block(engine, token, Layer::AuthConnectV6, &blob, addr, provider_context)?);
            entry.inbound_v6 = Some(install_block(engine, token, Layer::AuthRecvAcceptV6, &blob, addr, provider_context)?);
        }

        self.entries.push(entry);
        self.record(TxnEvent::Added(image.clone()));
        Ok(())
    }

    /// Decrements the reference count for `image`; at one, removes its
    /// filters and the entry itself.
    pub fn remove_block(&mut self, engine: &E, token: TransactionToken, image: &ImageName) -> Result<()> {
        let index = self.entries.iter().position(|e| &e.image == image).ok_or(Error::NotFound)?;

        if self.entries[index].refcount > 1 {
            self.entries[index].refcount -= 1;
            self.record(TxnEvent::Decremented(image.clone()));
            return Ok(());
        }

        let entry = self.entries.remove(index);
        for id in entry.filter_ids() {
            engine.remove_filter(token, id)?;
        }
        self.record(TxnEvent::Removed {
            entry,
            index,
        });
        Ok(())
    }

    /// Logs a list-swap to an empty list and removes every filter.
    pub fn reset(&mut self, engine: &E, token: TransactionToken) -> Result<()> {
        let previous = std::mem::take(&mut self.entries);
        for entry in &previous {
            for id in entry.filter_ids() {
                engine.remove_filter(token, id)?;
            }
        }
        self.record(TxnEvent::ListSwapped(previous));
        Ok(())
    }

    /// Rebuilds every entry's filters against new tunnel addresses. On any
    /// failure the partial rebuild is discarded and the live list is left
    /// untouched; on success the old list is logged as swapped so it is
    /// freed at commit.
    pub fn update_filters(
        &mut self,
        engine: &E,
        token: TransactionToken,
        tunnel_v4: Option<IpAddr>,
        tunnel_v6: Option<IpAddr>,
        provider_context: u64,
    ) -> Result<()> {
        let mut rebuilt = Vec::with_capacity(self.entries.len());
        for old in &self.entries {
            let blob = app_identifier_blob(&old.image);
            let mut entry = AppFilterEntry {
                image: old.image.clone(),
                refcount: old.refcount,
                outbound_v4: None,
                inbound_v4: None,
                outbound_v6: None,
                inbound_v6: None,
            };
            if let Some(addr) = tunnel_v4 {
                entry.outbound_v4 = Some(install_block(engine, token, Layer::AuthConnectV4, &blob, addr, provider_context)?);
                entry.inbound_v4 = Some(install_block(engine, token, Layer::AuthRecvAcceptV4, &blob, addr, provider_context)?);
            }
            if let Some(addr) = tunnel_v6 {
                entry.outbound_v6 = Some(install_block(engine, token, Layer::AuthConnectV6, &blob, addr, provider_context)?);
                entry.inbound_v6 = Some(install_block(engine, token, Layer::AuthRecvAcceptV6, &blob, addr, provider_context)?);
            }
            rebuilt.push(entry);
        }

        let previous = std::mem::replace(&mut self.entries, rebuilt);
        for entry in &previous {
            for id in entry.filter_ids() {
                let _ = engine.remove_filter(token, id);
            }
        }
        self.record(TxnEvent::ListSwapped(previous));
        Ok(())
    }

    pub fn entries(&self) -> &[AppFilterEntry] {
        &self.entries
    }

    pub fn total_refcount(&self) -> u32 {
        self.entries.iter().map(|e| e.refcount).sum()
    }
}

fn install_block<E: FilterEngine>(
    engine: &E,
    token: TransactionToken,
    layer: Layer,
    app_blob: &[u8],
    tunnel_addr: IpAddr,
    provider_context: u64,
) -> Result<FilterId> {
    engine.add_filter(
        token,
        FilterSpec {
            layer,
            action: Action::Block,
            conditions: vec![
                Condition::ApplicationIdentifier(app_blob.to_vec()),
                Condition::LocalAddressEquals(tunnel_addr),
            ],
            max_weight: true,
            provider_context,
        },
    )
}

/// Null-terminated byte-blob representation of an image name, mirroring the
/// application-identifier payload filters match against.
fn app_identifier_blob(image: &ImageName) -> Vec<u8> {
    let mut blob: Vec<u8> = image.as_str().encode_utf16().flat_map(u16::to_le_bytes).collect();
    blob.push(0);
    blob.push(0);
    blob
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::filters::MockEngine;
    use std::net::Ipv4Addr;

    fn v4(addr: [u8; 4]) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(addr))
    }

    #[test]
    fn register_then_register_increments_refcount() {
        let engine = MockEngine::new();
        let mut app_filters: AppFilters<std::sync::Arc<MockEngine>> = AppFilters::new();
        let image = ImageName::new("\\device\\app.exe");

        let token = engine.begin_transaction().unwrap();
        app_filters.begin_transaction().unwrap();
        app_filters
            .register_block(&engine, token, &image, Some(v4([10, 0, 0, 2])), None, 1)
            .unwrap();
        app_filters
            .register_block(&engine, token, &image, Some(v4([10, 0, 0, 2])), None, 1)
            .unwrap();
        app_filters.commit();
        engine.commit_transaction(token).unwrap();

        assert_eq!(app_filters.entries()[0].refcount, 2);
        assert_eq!(engine.filter_count(), 2);
    }

    #[test]
    fn abort_restores_refcount_and_filters() {
        let engine = MockEngine::new();
        let mut app_filters: AppFilters<std::sync::Arc<MockEngine>> = AppFilters::new();
        let image = ImageName::new("\\device\\app.exe");

        let token = engine.begin_transaction().unwrap();
        app_filters.begin_transaction().unwrap();
        app_filters
            .register_block(&engine, token, &image, Some(v4([10, 0, 0, 2])), None, 1)
            .unwrap();
        app_filters.abort(&engine, token).unwrap();
        engine.abort_transaction(token).unwrap();

        assert!(app_filters.entries().is_empty());
        assert_eq!(engine.filter_count(), 0);
    }

    #[test]
    fn remove_at_one_deletes_entry_and_filters() {
        let engine = MockEngine::new();
        let mut app_filters: AppFilters<std::sync::Arc<MockEngine>> = AppFilters::new();
        let image = ImageName::new("\\device\\app.exe");

        let token = engine.begin_transaction().unwrap();
        app_filters.begin_transaction().unwrap();
        app_filters
            .register_block(&engine, token, &image, Some(v4([10, 0, 0, 2])), None, 1)
            .unwrap();
        app_filters.remove_block(&engine, token, &image).unwrap();
        app_filters.commit();
        engine.commit_transaction(token).unwrap();

        assert!(app_filters.entries().is_empty());
        assert_eq!(engine.filter_count(), 0);
    }
}
