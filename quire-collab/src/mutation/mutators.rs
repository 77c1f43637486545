//! Named mutators and the built-in set for documents, folders and collections.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::record::{Effect, EntityKind, EntityStore, Record};
use super::{MutationContext, MutationError};

/// A deterministic state transition. Given the same store, args and context
/// it must produce the same effect on client and server.
pub trait Mutator: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, store: &EntityStore, args: &Value, ctx: &MutationContext) -> Result<Effect, MutationError>;
}

type MutatorFn = fn(&EntityStore, &Value, &MutationContext) -> Result<Effect, MutationError>;

struct FnMutator {
    name: String,
    run: MutatorFn,
}

impl Mutator for FnMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, store: &EntityStore, args: &Value, ctx: &MutationContext) -> Result<Effect, MutationError> {
        (self.run)(store, args, ctx)
    }
}

/// Mutators by name. Client and server must be built with the same set.
#[derive(Clone, Default)]
pub struct MutatorRegistry {
    mutators: HashMap<String, Arc<dyn Mutator>>,
}

impl std::fmt::Debug for MutatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorRegistry")
            .field("mutators", &self.names())
            .finish()
    }
}

impl MutatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in mutator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_fn("document.create", create_document);
        registry.register_fn("document.rename", rename_document);
        registry.register_fn("document.move", move_document);
        registry.register_fn("document.delete", delete_document);
        registry.register_fn("folder.create", create_folder);
        registry.register_fn("folder.rename", rename_folder);
        registry.register_fn("collection.create", create_collection);
        registry.register_fn("collection.add_document", add_to_collection);
        registry
    }

    pub fn register(&mut self, mutator: Arc<dyn Mutator>) {
        self.mutators.insert(mutator.name().to_string(), mutator);
    }

    pub fn register_fn(&mut self, name: &str, run: MutatorFn) {
        self.register(Arc::new(FnMutator {
            name: name.to_string(),
            run,
        }));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.mutators.contains_key(name)
    }

    /// Sorted mutator names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.mutators.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn execute(
        &self,
        name: &str,
        store: &EntityStore,
        args: &Value,
        ctx: &MutationContext,
    ) -> Result<Effect, MutationError> {
        let mutator = self
            .mutators
            .get(name)
            .ok_or_else(|| MutationError::UnknownMutation(name.to_string()))?;
        mutator.execute(store, args, ctx)
    }
}

fn parse<T: DeserializeOwned>(args: &Value) -> Result<T, MutationError> {
    T::deserialize(args).map_err(|e| MutationError::InvalidArgs(e.to_string()))
}

fn non_empty(field: &str, value: &str) -> Result<String, MutationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(MutationError::InvalidArgs(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn existing<'a>(store: &'a EntityStore, kind: EntityKind, id: &str) -> Result<&'a Record, MutationError> {
    store
        .get(kind, id)
        .ok_or_else(|| MutationError::NotFound(format!("{kind:?} {id}").to_lowercase()))
}

fn check_folder(store: &EntityStore, folder_id: Option<&str>) -> Result<(), MutationError> {
    match folder_id {
        Some(id) => existing(store, EntityKind::Folder, id).map(|_| ()),
        None => Ok(()),
    }
}

/// Fails if another document in `folder_id` already has `title`.
fn check_unique_title(
    store: &EntityStore,
    folder_id: Option<&str>,
    title: &str,
    except: &str,
) -> Result<(), MutationError> {
    let clash = store.of_kind(EntityKind::Document).any(|doc| {
        doc.id != except && doc.str_field("folder_id") == folder_id && doc.str_field("title") == Some(title)
    });
    if clash {
        return Err(MutationError::Duplicate(format!("title {title:?} already used in this folder")));
    }
    Ok(())
}

fn set_optional(record: &mut Record, key: &str, value: Option<&str>) {
    match value {
        Some(v) => record.set(key, v),
        None => {
            record.fields.remove(key);
        }
    }
}

#[derive(Deserialize)]
struct CreateDocumentArgs {
    id: String,
    title: String,
    #[serde(default)]
    folder_id: Option<String>,
}

fn create_document(store: &EntityStore, args: &Value, ctx: &MutationContext) -> Result<Effect, MutationError> {
    let args: CreateDocumentArgs = parse(args)?;
    let title = non_empty("title", &args.title)?;
    if store.contains(EntityKind::Document, &args.id) {
        return Err(MutationError::AlreadyExists(format!("document {}", args.id)));
    }
    let folder = args.folder_id.as_deref();
    check_folder(store, folder)?;
    check_unique_title(store, folder, &title, &args.id)?;

    let mut record = Record::new(EntityKind::Document, &args.id)
        .with("title", title)
        .with("created_by", ctx.client_id.as_str())
        .with("created_at", ctx.now_ms)
        .with("updated_at", ctx.now_ms);
    set_optional(&mut record, "folder_id", folder);
    Ok(Effect::new().upsert(record))
}

#[derive(Deserialize)]
struct RenameDocumentArgs {
    id: String,
    title: String,
}

fn rename_document(store: &EntityStore, args: &Value, ctx: &MutationContext) -> Result<Effect, MutationError> {
    let args: RenameDocumentArgs = parse(args)?;
    let title = non_empty("title", &args.title)?;
    let doc = existing(store, EntityKind::Document, &args.id)?;
    check_unique_title(store, doc.str_field("folder_id"), &title, &args.id)?;

    let mut record = doc.clone();
    record.set("title", title);
    record.set("updated_at", ctx.now_ms);
    Ok(Effect::new().upsert(record))
}

#[derive(Deserialize)]
struct MoveDocumentArgs {
    id: String,
    #[serde(default)]
    folder_id: Option<String>,
}

fn move_document(store: &EntityStore, args: &Value, ctx: &MutationContext) -> Result<Effect, MutationError> {
    let args: MoveDocumentArgs = parse(args)?;
    let doc = existing(store, EntityKind::Document, &args.id)?;
    let target = args.folder_id.as_deref();
    check_folder(store, target)?;
    let title = doc.str_field("title").unwrap_or_default();
    check_unique_title(store, target, title, &args.id)?;

    let mut record = doc.clone();
    set_optional(&mut record, "folder_id", target);
    record.set("updated_at", ctx.now_ms);
    Ok(Effect::new().upsert(record))
}

#[derive(Deserialize)]
struct IdArgs {
    id: String,
}

fn delete_document(store: &EntityStore, args: &Value, ctx: &MutationContext) -> Result<Effect, MutationError> {
    let args: IdArgs = parse(args)?;
    existing(store, EntityKind::Document, &args.id)?;

    let mut effect = Effect::new().delete(EntityKind::Document, &args.id);
    for collection in store.of_kind(EntityKind::Collection) {
        let members = document_ids(collection);
        if members.iter().any(|m| *m == args.id) {
            let kept: Vec<Value> = members
                .into_iter()
                .filter(|m| *m != args.id)
                .map(Value::from)
                .collect();
            let mut record = collection.clone();
            record.set("document_ids", kept);
            record.set("updated_at", ctx.now_ms);
            effect = effect.upsert(record);
        }
    }
    Ok(effect)
}

#[derive(Deserialize)]
struct CreateFolderArgs {
    id: String,
    name: String,
    #[serde(default)]
    parent_id: Option<String>,
}

fn check_unique_folder_name(
    store: &EntityStore,
    parent_id: Option<&str>,
    name: &str,
    except: &str,
) -> Result<(), MutationError> {
    let clash = store.of_kind(EntityKind::Folder).any(|folder| {
        folder.id != except && folder.str_field("parent_id") == parent_id && folder.str_field("name") == Some(name)
    });
    if clash {
        return Err(MutationError::Duplicate(format!("folder {name:?} already exists here")));
    }
    Ok(())
}

fn create_folder(store: &EntityStore, args: &Value, ctx: &MutationContext) -> Result<Effect, MutationError> {
    let args: CreateFolderArgs = parse(args)?;
    let name = non_empty("name", &args.name)?;
    if store.contains(EntityKind::Folder, &args.id) {
        return Err(MutationError::AlreadyExists(format!("folder {}", args.id)));
    }
    let parent = args.parent_id.as_deref();
    check_folder(store, parent)?;
    check_unique_folder_name(store, parent, &name, &args.id)?;

    let mut record = Record::new(EntityKind::Folder, &args.id)
        .with("name", name)
        .with("created_at", ctx.now_ms)
        .with("updated_at", ctx.now_ms);
    set_optional(&mut record, "parent_id", parent);
    Ok(Effect::new().upsert(record))
}

#[derive(Deserialize)]
struct RenameFolderArgs {
    id: String,
    name: String,
}

fn rename_folder(store: &EntityStore, args: &Value, ctx: &MutationContext) -> Result<Effect, MutationError> {
    let args: RenameFolderArgs = parse(args)?;
    let name = non_empty("name", &args.name)?;
    let folder = existing(store, EntityKind::Folder, &args.id)?;
    check_unique_folder_name(store, folder.str_field("parent_id"), &name, &args.id)?;

    let mut record = folder.clone();
    record.set("name", name);
    record.set("updated_at", ctx.now_ms);
    Ok(Effect::new().upsert(record))
}

#[derive(Deserialize)]
struct CreateCollectionArgs {
    id: String,
    name: String,
}

fn create_collection(store: &EntityStore, args: &Value, ctx: &MutationContext) -> Result<Effect, MutationError> {
    let args: CreateCollectionArgs = parse(args)?;
    let name = non_empty("name", &args.name)?;
    if store.contains(EntityKind::Collection, &args.id) {
        return Err(MutationError::AlreadyExists(format!("collection {}", args.id)));
    }
    if store
        .of_kind(EntityKind::Collection)
        .any(|c| c.str_field("name") == Some(name.as_str()))
    {
        return Err(MutationError::Duplicate(format!("collection {name:?} already exists")));
    }

    let record = Record::new(EntityKind::Collection, &args.id)
        .with("name", name)
        .with("document_ids", Vec::<Value>::new())
        .with("created_at", ctx.now_ms)
        .with("updated_at", ctx.now_ms);
    Ok(Effect::new().upsert(record))
}

#[derive(Deserialize)]
struct AddToCollectionArgs {
    collection_id: String,
    document_id: String,
}

fn document_ids(collection: &Record) -> Vec<String> {
    collection
        .get("document_ids")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn add_to_collection(store: &EntityStore, args: &Value, ctx: &MutationContext) -> Result<Effect, MutationError> {
    let args: AddToCollectionArgs = parse(args)?;
    let collection = existing(store, EntityKind::Collection, &args.collection_id)?;
    existing(store, EntityKind::Document, &args.document_id)?;

    let mut members = document_ids(collection);
    if members.contains(&args.document_id) {
        return Ok(Effect::new());
    }
    members.push(args.document_id);

    let mut record = collection.clone();
    record.set("document_ids", members);
    record.set("updated_at", ctx.now_ms);
    Ok(Effect::new().upsert(record))
}
