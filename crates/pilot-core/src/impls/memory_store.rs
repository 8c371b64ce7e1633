//! In-memory document store.
//!
//! Used by the tests and by `pilot run --local` demos. It behaves like the
//! CouchDB store where the rest of the crate can tell the difference:
//! revisions change on every save, stale or missing revisions conflict, views
//! are sorted by key, and inline attachments come back as stubs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::error::{PilotError, Result};
use crate::impls::views;
use crate::ports::{Document, DocumentStore, Revision, ViewOptions, ViewResult, ViewRow};

const ATTACHMENTS: &str = "_attachments";

pub struct InMemoryStore {
    name: String,
    docs: Mutex<BTreeMap<String, Document>>,
}

impl InMemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.docs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.lock().await.is_empty()
    }

    fn next_revision(current: Option<&Revision>) -> Revision {
        let generation = current.and_then(Revision::generation).unwrap_or(0) + 1;
        Revision::new(format!("{generation}-{:032x}", rand::random::<u128>()))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

/// Replace attachment payloads with stubs, as a store read does.
fn stubbed(mut doc: Document) -> Document {
    if let Some(Value::Object(atts)) = doc.body.get_mut(ATTACHMENTS) {
        for att in atts.values_mut() {
            if let Value::Object(att) = att
                && let Some(Value::String(data)) = att.remove("data")
            {
                let length = BASE64.decode(&data).map(|b| b.len()).unwrap_or(0);
                att.insert("stub".into(), json!(true));
                att.insert("length".into(), json!(length));
            }
        }
    }
    doc
}

/// Resolve stubs in `incoming` against the payloads stored in `previous`.
fn merge_attachments(incoming: &mut Document, previous: Option<&Document>) -> Result<()> {
    let Some(Value::Object(atts)) = incoming.body.get_mut(ATTACHMENTS) else {
        return Ok(());
    };
    for (name, att) in atts.iter_mut() {
        let is_stub = att.get("stub").and_then(Value::as_bool).unwrap_or(false);
        if !is_stub {
            continue;
        }
        let stored = previous
            .and_then(|p| p.get(ATTACHMENTS))
            .and_then(|a| a.get(name))
            .cloned()
            .ok_or_else(|| {
                PilotError::Store(format!("attachment stub {name} of {} has no data", incoming.id))
            })?;
        *att = stored;
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str) -> Result<Document> {
        let docs = self.docs.lock().await;
        docs.get(id)
            .cloned()
            .map(stubbed)
            .ok_or_else(|| PilotError::NotFound(id.to_string()))
    }

    async fn save(&self, mut doc: Document) -> Result<Document> {
        let mut docs = self.docs.lock().await;
        let current = docs.get(&doc.id);

        // CAS: the caller must have seen the latest revision
        let current_rev = current.and_then(|d| d.rev.as_ref());
        if doc.rev.as_ref() != current_rev {
            return Err(PilotError::Conflict { id: doc.id });
        }

        merge_attachments(&mut doc, current)?;
        doc.rev = Some(Self::next_revision(current_rev));
        docs.insert(doc.id.clone(), doc.clone());
        Ok(stubbed(doc))
    }

    async fn delete(&self, doc: &Document) -> Result<()> {
        let mut docs = self.docs.lock().await;
        let current = docs
            .get(&doc.id)
            .ok_or_else(|| PilotError::NotFound(doc.id.clone()))?;
        if current.rev != doc.rev {
            return Err(PilotError::Conflict { id: doc.id.clone() });
        }
        docs.remove(&doc.id);
        Ok(())
    }

    async fn view(&self, name: &str, options: ViewOptions) -> Result<ViewResult> {
        let def = views::lookup(name).ok_or_else(|| PilotError::InvalidView(name.to_string()))?;
        let docs = self.docs.lock().await;

        let mut rows: Vec<ViewRow> = docs
            .values()
            .filter_map(|doc| {
                (def.map)(doc).map(|(key, value)| ViewRow {
                    id: doc.id.clone(),
                    key,
                    value,
                    doc: options.include_docs.then(|| stubbed(doc.clone())),
                })
            })
            .collect();
        drop(docs);

        rows.sort_by(|a, b| views::collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
        let total_rows = rows.len();
        let rows = rows
            .into_iter()
            .skip(options.skip.unwrap_or(0))
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();

        Ok(ViewResult { total_rows, rows })
    }

    async fn get_attachment(&self, id: &str, name: &str) -> Result<Vec<u8>> {
        let docs = self.docs.lock().await;
        let data = docs
            .get(id)
            .and_then(|d| d.get(ATTACHMENTS))
            .and_then(|a| a.get(name))
            .and_then(|a| a.get("data"))
            .and_then(Value::as_str)
            .ok_or_else(|| PilotError::NotFound(format!("{id}/{name}")))?;
        BASE64
            .decode(data)
            .map_err(|e| PilotError::Store(format!("corrupt attachment {id}/{name}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Document {
        Document::new(id)
            .with_field("type", json!("task"))
            .with_field("lock", json!(0))
            .with_field("done", json!(0))
    }

    #[tokio::test]
    async fn save_assigns_increasing_revisions() {
        let store = InMemoryStore::default();
        let saved = store.save(task("t1")).await.unwrap();
        let rev1 = saved.rev.clone().unwrap();
        assert_eq!(rev1.generation(), Some(1));

        let saved = store.save(saved.with_field("lock", json!(5))).await.unwrap();
        assert_eq!(saved.rev.unwrap().generation(), Some(2));
    }

    #[tokio::test]
    async fn stale_revision_conflicts() {
        let store = InMemoryStore::default();
        let first = store.save(task("t1")).await.unwrap();
        let copy_a = store.get("t1").await.unwrap();
        let copy_b = first.clone();

        store.save(copy_a.with_field("lock", json!(1))).await.unwrap();
        let err = store.save(copy_b.with_field("lock", json!(2))).await.unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(store.get("t1").await.unwrap().int("lock"), 1);
    }

    #[tokio::test]
    async fn creating_an_existing_id_conflicts() {
        let store = InMemoryStore::default();
        store.save(task("t1")).await.unwrap();
        let err = store.save(task("t1")).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn missing_document_is_not_found() {
        let store = InMemoryStore::default();
        assert!(store.get("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_requires_current_revision() {
        let store = InMemoryStore::default();
        let saved = store.save(task("t1")).await.unwrap();
        store.save(saved.clone()).await.unwrap();

        assert!(store.delete(&saved).await.unwrap_err().is_conflict());
        let fresh = store.get("t1").await.unwrap();
        store.delete(&fresh).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn view_sorts_and_pages() {
        let store = InMemoryStore::default();
        for id in ["t3", "t1", "t2"] {
            store.save(task(id)).await.unwrap();
        }

        let all = store.view("pending", ViewOptions::default()).await.unwrap();
        let ids: Vec<_> = all.rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["t1", "t2", "t3"]);
        assert!(all.rows[0].doc.is_none());

        let page = store
            .view("pending", ViewOptions::default().skip(1).limit(1).include_docs())
            .await
            .unwrap();
        assert_eq!(page.total_rows, 3);
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].id, "t2");
        assert!(page.rows[0].doc.is_some());
    }

    #[tokio::test]
    async fn unknown_view_is_rejected() {
        let store = InMemoryStore::default();
        let err = store.view("bogus", ViewOptions::default()).await.unwrap_err();
        assert!(matches!(err, PilotError::InvalidView(_)));
    }

    #[tokio::test]
    async fn attachments_are_stubbed_and_survive_resave() {
        let store = InMemoryStore::default();
        let doc = task("t1").with_field(
            ATTACHMENTS,
            json!({"out.txt": {"content_type": "text/plain", "data": BASE64.encode(b"result")}}),
        );
        store.save(doc).await.unwrap();

        let fetched = store.get("t1").await.unwrap();
        let att = &fetched.get(ATTACHMENTS).unwrap()["out.txt"];
        assert_eq!(att["stub"], json!(true));
        assert_eq!(att["length"], json!(6));

        // re-saving the stub keeps the stored payload
        store.save(fetched.with_field("done", json!(9))).await.unwrap();
        assert_eq!(store.get_attachment("t1", "out.txt").await.unwrap(), b"result");
    }
}
