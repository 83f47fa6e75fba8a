//! Explicit dependency container built once at startup.
//!
//! [`VaultContext`] owns the shared services; [`Storages`] wires the
//! per-kind storage, encryption and device writers on top of it.

use crate::content::{Converter, LocalConverter, RichTextParser};
use crate::crypto::{
    datagram, AttachmentReencryptor, EntityEncryption, IntegrationEncryption, KeyRing,
    ReencryptConfig, SharedEntityEncryption,
};
use crate::entity::{
    AppSetting, Document, Entity, Event, Folder, Image, ImageData, Integration, LocalConflict,
    Task, Version,
};
use crate::events::EventBus;
use crate::io::{AttachmentIo, DocumentIo, FolderIo};
use crate::protocol::{Request, ServiceClient};
use crate::queue::VaultQueues;
use crate::registry::FilepathRegistry;
use crate::store::{
    ConflictHooks, DocumentHooks, EntityStorage, FolderHooks, ImageResolver, LocalStore,
};
use crate::vault::{Vault, VaultRegistry};
use crate::writer::{AttachmentSerializer, ContentWriter, DocumentSerializer, FolderSerializer};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct VaultContext {
    client_id: String,
    client: Option<Arc<ServiceClient>>,
    converter: Arc<dyn Converter>,
    registry: Arc<FilepathRegistry>,
    store: Arc<LocalStore>,
    keys: Arc<KeyRing>,
    events: Arc<EventBus>,
    vaults: Arc<VaultRegistry>,
    queues: Arc<VaultQueues>,
}

impl Default for VaultContext {
    fn default() -> Self {
        Self::new()
    }
}

impl VaultContext {
    /// Context without a device connection: nothing is mirrored to disk.
    pub fn new() -> Self {
        let events = Arc::new(EventBus::new());
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            client: None,
            converter: Arc::new(LocalConverter),
            registry: Arc::new(FilepathRegistry::new()),
            store: Arc::new(LocalStore::new(events.clone())),
            keys: Arc::new(KeyRing::new()),
            events,
            vaults: Arc::new(VaultRegistry::new()),
            queues: Arc::new(VaultQueues::new()),
        }
    }

    /// Context talking to the other services through `client`.
    pub fn with_client(client: Arc<ServiceClient>) -> Self {
        Self {
            client: Some(client),
            ..Self::new()
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client(&self) -> Option<&Arc<ServiceClient>> {
        self.client.as_ref()
    }

    pub fn converter(&self) -> &Arc<dyn Converter> {
        &self.converter
    }

    pub fn registry(&self) -> &Arc<FilepathRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn keys(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn vaults(&self) -> &Arc<VaultRegistry> {
        &self.vaults
    }

    pub fn queues(&self) -> &Arc<VaultQueues> {
        &self.queues
    }

    pub fn add_vault(&self, vault: Vault) {
        self.vaults.insert(vault);
    }

    /// Fire-and-forget notification to another service. Dropped with a debug
    /// log when the context has no client.
    pub async fn notify(&self, request: Request) {
        let Some(client) = &self.client else {
            debug!("No client, dropping {}", request.operation());
            return;
        };
        let operation = request.operation();
        if let Err(e) = client.emit(request).await {
            warn!("Failed to emit {}: {}", operation, e);
        }
    }

    fn base_encryption<T: Entity>(&self, datagram: datagram::Datagram) -> EntityEncryption<T> {
        EntityEncryption::new(datagram, self.keys.clone(), self.vaults.clone())
    }
}

/// Per-kind storage services of a context.
#[derive(Clone)]
pub struct Storages {
    pub documents: EntityStorage<Document>,
    pub folders: EntityStorage<Folder>,
    pub tasks: EntityStorage<Task>,
    pub events: EntityStorage<Event>,
    pub integrations: EntityStorage<Integration>,
    pub images: EntityStorage<Image>,
    pub image_data: EntityStorage<ImageData>,
    pub versions: EntityStorage<Version>,
    pub local_conflicts: EntityStorage<LocalConflict>,
    pub app_settings: EntityStorage<AppSetting>,
    pub resolver: Arc<ImageResolver>,
    pub reencryptor: AttachmentReencryptor,
}

impl Storages {
    pub fn new(ctx: Arc<VaultContext>) -> Self {
        Self::with_config(ctx, ReencryptConfig::default())
    }

    pub fn with_config(ctx: Arc<VaultContext>, reencrypt: ReencryptConfig) -> Self {
        let rich = Arc::new(RichTextParser::new(ctx.converter.clone()));

        let image_data = EntityStorage::new(
            ctx.clone(),
            Arc::new(ctx.base_encryption::<ImageData>(datagram::IMAGE_DATA)),
        );
        let resolver = Arc::new(ImageResolver::new(ctx.clone(), image_data.clone()));

        let mut images = EntityStorage::new(
            ctx.clone(),
            Arc::new(ctx.base_encryption::<Image>(datagram::IMAGE_OBJECT)),
        );
        let mut documents_encryption =
            SharedEntityEncryption::new(ctx.base_encryption::<Document>(datagram::DOCUMENT));
        let mut documents = None;
        let mut folders = None;

        if let Some(client) = &ctx.client {
            images = images.with_writer(ContentWriter::new(
                Arc::new(AttachmentSerializer::new(resolver.clone())),
                Arc::new(AttachmentIo::new(client.clone())),
            ));
            documents = Some(ContentWriter::new(
                Arc::new(DocumentSerializer::new(rich.clone())),
                Arc::new(DocumentIo::new(client.clone())),
            ));
            folders = Some(ContentWriter::new(
                Arc::new(FolderSerializer),
                Arc::new(FolderIo::new(client.clone())),
            ));
        }

        let reencryptor = AttachmentReencryptor::new(
            ctx.clone(),
            images.clone(),
            image_data.clone(),
            resolver.clone(),
            reencrypt,
        );
        documents_encryption = documents_encryption.with_hook(Arc::new(reencryptor.clone()));

        let mut document_storage = EntityStorage::new(ctx.clone(), Arc::new(documents_encryption))
            .with_hooks(Arc::new(DocumentHooks::new(ctx.clone(), rich)));
        if let Some(writer) = documents {
            document_storage = document_storage.with_writer(writer);
        }

        let mut folder_storage = EntityStorage::new(
            ctx.clone(),
            Arc::new(SharedEntityEncryption::new(
                ctx.base_encryption::<Folder>(datagram::FOLDER),
            )),
        )
        .with_hooks(Arc::new(FolderHooks::new(ctx.clone())));
        if let Some(writer) = folders {
            folder_storage = folder_storage.with_writer(writer);
        }

        Self {
            documents: document_storage,
            folders: folder_storage,
            tasks: EntityStorage::new(
                ctx.clone(),
                Arc::new(ctx.base_encryption::<Task>(datagram::TASK)),
            ),
            events: EntityStorage::new(
                ctx.clone(),
                Arc::new(ctx.base_encryption::<Event>(datagram::EVENT)),
            ),
            integrations: EntityStorage::new(
                ctx.clone(),
                Arc::new(IntegrationEncryption::new(
                    ctx.base_encryption::<Integration>(datagram::INTEGRATION),
                )),
            ),
            images,
            image_data,
            versions: EntityStorage::new(
                ctx.clone(),
                Arc::new(ctx.base_encryption::<Version>(datagram::VERSION)),
            ),
            local_conflicts: EntityStorage::new(
                ctx.clone(),
                Arc::new(ctx.base_encryption::<LocalConflict>(datagram::NONE)),
            )
            .with_hooks(Arc::new(ConflictHooks::new(ctx.clone()))),
            app_settings: EntityStorage::new(
                ctx.clone(),
                Arc::new(ctx.base_encryption::<AppSetting>(datagram::NONE)),
            ),
            resolver,
            reencryptor,
        }
    }
}
