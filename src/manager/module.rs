use std::{cmp::Ordering, collections::BTreeMap, sync::Arc};

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::{
    cluster::LockedMap,
    core::{GatewayError, GatewayResult},
    module::ModuleDescriptor,
};

use super::store::DescriptorStore;

/// Product name -> descriptors ordered by ascending version.
type ProductIndex = BTreeMap<String, Vec<Arc<ModuleDescriptor>>>;

/// Registry of known module descriptors.
///
/// The locked map is the cluster-wide source of truth; the store keeps the
/// descriptors durable and the local maps serve lookups.
pub struct ModuleManager {
    store: Arc<dyn DescriptorStore<ModuleDescriptor>>,
    registry: LockedMap<ModuleDescriptor>,
    modules: DashMap<String, Arc<ModuleDescriptor>>,
    products: ArcSwap<ProductIndex>,
}

fn version_order(a: &ModuleDescriptor, b: &ModuleDescriptor) -> Ordering {
    a.compare(b).cmp(&0)
}

impl ModuleManager {
    pub fn new(
        store: Arc<dyn DescriptorStore<ModuleDescriptor>>,
        registry: LockedMap<ModuleDescriptor>,
    ) -> Self {
        Self {
            store,
            registry,
            modules: DashMap::new(),
            products: ArcSwap::from_pointee(ProductIndex::new()),
        }
    }

    /// Registers a new module.
    pub async fn create(&self, md: ModuleDescriptor) -> GatewayResult<Arc<ModuleDescriptor>> {
        md.check()?;
        if self.modules.contains_key(&md.id) {
            return Err(GatewayError::User(format!("Module {} already exists", md.id)));
        }

        self.registry.add(&md.id, &md.id, &md).await?;
        if let Err(e) = self.store.insert(&md.id, &md).await {
            if let Err(undo) = self.registry.remove(&md.id, &md.id).await {
                log::error!("Failed to undo registration of {}: {undo}", md.id);
            }
            return Err(e);
        }

        log::info!("Module {} registered", md.id);
        Ok(self.index(md))
    }

    /// Registers `md` unless an identical descriptor is already known, as
    /// happens when several nodes provision the same static modules.
    pub async fn ensure(&self, md: ModuleDescriptor) -> GatewayResult<Arc<ModuleDescriptor>> {
        md.check()?;
        match self.registry.get(&md.id, &md.id).await {
            Ok(existing) if existing == md => {
                if let Err(e) = self.store.insert(&md.id, &md).await {
                    if e.kind() != crate::core::ErrorKind::User {
                        return Err(e);
                    }
                }
                Ok(self.index(md))
            }
            Ok(_) => Err(GatewayError::User(format!(
                "Module {} is registered with a different descriptor",
                md.id
            ))),
            Err(e) if e.is_not_found() => self.create(md).await,
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, id: &str) -> GatewayResult<Arc<ModuleDescriptor>> {
        self.modules
            .get(id)
            .map(|md| md.value().clone())
            .ok_or_else(|| GatewayError::NotFound(format!("Module {id} not found")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    /// Every module, ordered by product and version.
    pub fn list(&self) -> Vec<Arc<ModuleDescriptor>> {
        self.products
            .load()
            .values()
            .flat_map(|versions| versions.iter().cloned())
            .collect()
    }

    /// Highest version registered for `product`.
    pub fn latest(&self, product: &str) -> GatewayResult<Arc<ModuleDescriptor>> {
        self.products
            .load()
            .get(product)
            .and_then(|versions| versions.last().cloned())
            .ok_or_else(|| GatewayError::NotFound(format!("No module for product {product}")))
    }

    /// Accepts a full module id or a bare product name, which means its latest version.
    pub fn resolve_id(&self, id_or_product: &str) -> GatewayResult<String> {
        if self.contains(id_or_product) {
            return Ok(id_or_product.to_string());
        }
        self.latest(id_or_product)
            .map(|md| md.id.clone())
            .map_err(|_| GatewayError::NotFound(format!("Module {id_or_product} not found")))
    }

    /// Descriptors for `ids`, in the given order.
    pub fn get_many(&self, ids: &[String]) -> GatewayResult<Vec<Arc<ModuleDescriptor>>> {
        ids.iter().map(|id| self.get(id)).collect()
    }

    /// Like [`get`](Self::get), falling back to the cluster registry for
    /// modules registered by other nodes.
    pub async fn fetch(&self, id: &str) -> GatewayResult<Arc<ModuleDescriptor>> {
        if let Ok(md) = self.get(id) {
            return Ok(md);
        }
        match self.registry.get(id, id).await {
            Ok(md) => {
                log::debug!("Module {id} fetched from the registry");
                Ok(self.index(md))
            }
            Err(e) if e.is_not_found() => {
                Err(GatewayError::NotFound(format!("Module {id} not found")))
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the cluster registry holds `id`, regardless of the local view.
    pub async fn is_registered(&self, id: &str) -> GatewayResult<bool> {
        match self.registry.get(id, id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn fetch_many(&self, ids: &[String]) -> GatewayResult<Vec<Arc<ModuleDescriptor>>> {
        let mut mds = Vec::with_capacity(ids.len());
        for id in ids {
            mds.push(self.fetch(id).await?);
        }
        Ok(mds)
    }

    /// [`resolve_id`](Self::resolve_id) against the cluster registry: full
    /// ids are fetched, products are resolved after a reload.
    pub async fn lookup(&self, id_or_product: &str) -> GatewayResult<Arc<ModuleDescriptor>> {
        if let Ok(id) = self.resolve_id(id_or_product) {
            return self.fetch(&id).await;
        }
        match self.fetch(id_or_product).await {
            Err(e) if e.is_not_found() => {
                self.reload().await?;
                self.get(&self.resolve_id(id_or_product)?)
            }
            res => res,
        }
    }

    pub async fn delete(&self, id: &str) -> GatewayResult<()> {
        self.fetch(id).await?;

        match self.registry.remove(id, id).await {
            Ok(_) => {}
            // already removed by another node
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        match self.store.delete(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.modules.remove(id);
        self.reload_product_index();
        log::info!("Module {id} removed");
        Ok(())
    }

    /// Rebuilds the local view from the cluster registry.
    pub async fn reload(&self) -> GatewayResult<usize> {
        let mut fresh = Vec::new();
        for id in self.registry.get_keys().await? {
            match self.registry.get(&id, &id).await {
                Ok(md) => fresh.push(md),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.modules.clear();
        for md in fresh {
            self.modules.insert(md.id.clone(), Arc::new(md));
        }
        self.reload_product_index();

        log::info!("Reloaded {} modules", self.modules.len());
        Ok(self.modules.len())
    }

    fn index(&self, md: ModuleDescriptor) -> Arc<ModuleDescriptor> {
        let md = Arc::new(md);
        self.modules.insert(md.id.clone(), md.clone());
        self.reload_product_index();
        md
    }

    fn reload_product_index(&self) {
        let mut index = ProductIndex::new();
        for md in self.modules.iter() {
            index
                .entry(md.product())
                .or_default()
                .push(md.value().clone());
        }
        for versions in index.values_mut() {
            versions.sort_by(|a, b| version_order(a, b));
        }
        self.products.store(Arc::new(index));
    }
}
