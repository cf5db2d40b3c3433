//! Text store: textos partidos en secciones direccionables por id.
//!
//! Las secciones de un texto tienen ids crecientes en el orden del texto, así
//! que "ordenar por id" equivale a "ordenar por posición". También emite los
//! task ids (secuencia persistible), para no depender de un contador local
//! del splitter.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use glob::glob;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::error::StoreError;
pub use crate::message::SectionId;
use crate::message::TaskId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextInfo {
    pub name: String,
    pub sections: usize,
    pub loaded_at: DateTime<Utc>,
}

#[async_trait]
pub trait TextStore: Send + Sync {
    async fn list_texts(&self) -> Result<Vec<TextInfo>>;

    /// Ids de las secciones del texto, en orden.
    async fn section_ids(&self, text: &str) -> Result<Vec<SectionId>>;

    /// Contenido de las secciones pedidas, ordenado por id.
    async fn fetch_sections(&self, ids: &[SectionId]) -> Result<Vec<String>>;

    /// Próximo task id de la secuencia.
    async fn next_task_id(&self) -> Result<TaskId>;
}

/// Parte `content` en trozos de a lo sumo `max_bytes` bytes sin cortar un
/// carácter UTF-8 al medio. Si un carácter no entra solo, va entero en su trozo.
pub fn chunk_text(content: &str, max_bytes: usize) -> Vec<String> {
    let max_bytes = max_bytes.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < content.len() {
        let mut end = (start + max_bytes).min(content.len());
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // carácter más largo que max_bytes
            end = start
                + content[start..]
                    .chars()
                    .next()
                    .map(char::len_utf8)
                    .unwrap_or(1);
        }
        chunks.push(content[start..end].to_string());
        start = end;
    }

    chunks
}

/// Lee los `*.txt` de `dir`, ordenados por nombre. El nombre del texto es el
/// nombre del archivo sin extensión; bytes UTF-8 inválidos se reemplazan.
pub fn read_text_files(dir: &Path) -> Result<Vec<(String, String)>> {
    let pattern = dir.join("*.txt");
    let pattern = pattern.to_string_lossy();

    let mut paths: Vec<PathBuf> = glob(&pattern)
        .with_context(|| format!("patrón inválido: {pattern}"))?
        .filter_map(|entry| entry.ok())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(name) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
            continue;
        };
        let bytes = fs::read(&path).with_context(|| format!("leyendo {}", path.display()))?;
        out.push((name, String::from_utf8_lossy(&bytes).into_owned()));
    }

    Ok(out)
}

/* ---------------- secuencia de task ids ---------------- */

/// Secuencia monótona de task ids. Con `path`, el último id emitido se guarda
/// en disco y sobrevive reinicios del master.
#[derive(Debug)]
pub struct TaskSequence {
    last: Mutex<TaskId>,
    path: Option<PathBuf>,
}

impl TaskSequence {
    pub fn in_memory() -> Self {
        Self {
            last: Mutex::new(0),
            path: None,
        }
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        let last = match fs::read_to_string(&path) {
            Ok(s) => s
                .trim()
                .parse::<TaskId>()
                .with_context(|| format!("secuencia corrupta en {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e).with_context(|| format!("leyendo {}", path.display())),
        };

        Ok(Self {
            last: Mutex::new(last),
            path: Some(path),
        })
    }

    pub fn next(&self) -> Result<TaskId> {
        let mut last = self
            .last
            .lock()
            .map_err(|_| anyhow::anyhow!("lock de secuencia envenenado"))?;
        let id = *last + 1;

        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            // primero a un temporal y después rename, para no dejar el archivo a medias
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, id.to_string())?;
            fs::rename(&tmp, path)?;
        }

        *last = id;
        Ok(id)
    }
}

/* ---------------- store en memoria ---------------- */

#[derive(Debug, Clone)]
struct TextEntry {
    section_ids: Vec<SectionId>,
    loaded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    texts: BTreeMap<String, TextEntry>,
    sections: BTreeMap<SectionId, String>,
    next_section_id: SectionId,
}

#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    sequence: TaskSequence,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(TaskSequence::in_memory())
    }
}

impl MemoryStore {
    pub fn new(sequence: TaskSequence) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            sequence,
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| anyhow::anyhow!("lock del store envenenado"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| anyhow::anyhow!("lock del store envenenado"))
    }

    /// Guarda un texto partido en secciones de `section_size` bytes.
    pub fn insert_text(&self, name: &str, content: &str, section_size: usize) -> Result<TextInfo> {
        let mut inner = self.write()?;
        if inner.texts.contains_key(name) {
            return Err(StoreError::TextExists(name.to_string()).into());
        }

        let mut ids = Vec::new();
        for chunk in chunk_text(content, section_size) {
            inner.next_section_id += 1;
            let id = inner.next_section_id;
            inner.sections.insert(id, chunk);
            ids.push(id);
        }

        let entry = TextEntry {
            section_ids: ids,
            loaded_at: Utc::now(),
        };
        let info = TextInfo {
            name: name.to_string(),
            sections: entry.section_ids.len(),
            loaded_at: entry.loaded_at,
        };
        inner.texts.insert(name.to_string(), entry);
        Ok(info)
    }

    /// Carga todos los `*.txt` de un directorio. Los que fallan se loguean y
    /// se saltean.
    pub fn load_dir(&self, dir: &Path, section_size: usize) -> Result<Vec<TextInfo>> {
        let mut loaded = Vec::new();
        for (name, content) in read_text_files(dir)? {
            match self.insert_text(&name, &content, section_size) {
                Ok(info) => loaded.push(info),
                Err(e) => tracing::warn!("no se pudo cargar '{}': {:#}", name, e),
            }
        }
        Ok(loaded)
    }

    pub fn texts(&self) -> Result<Vec<TextInfo>> {
        let inner = self.read()?;
        Ok(inner
            .texts
            .iter()
            .map(|(name, e)| TextInfo {
                name: name.clone(),
                sections: e.section_ids.len(),
                loaded_at: e.loaded_at,
            })
            .collect())
    }

    pub fn ids_of(&self, text: &str) -> Result<Vec<SectionId>> {
        let inner = self.read()?;
        match inner.texts.get(text) {
            Some(e) => Ok(e.section_ids.clone()),
            None => Err(StoreError::TextNotFound(text.to_string()).into()),
        }
    }

    pub fn sections(&self, ids: &[SectionId]) -> Result<Vec<String>> {
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let inner = self.read()?;
        sorted
            .into_iter()
            .map(|id| {
                inner
                    .sections
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| anyhow::Error::from(StoreError::MissingSection(id)))
            })
            .collect()
    }

    pub fn issue_task_id(&self) -> Result<TaskId> {
        self.sequence.next()
    }
}

#[async_trait]
impl TextStore for MemoryStore {
    async fn list_texts(&self) -> Result<Vec<TextInfo>> {
        self.texts()
    }

    async fn section_ids(&self, text: &str) -> Result<Vec<SectionId>> {
        self.ids_of(text)
    }

    async fn fetch_sections(&self, ids: &[SectionId]) -> Result<Vec<String>> {
        self.sections(ids)
    }

    async fn next_task_id(&self) -> Result<TaskId> {
        self.issue_task_id()
    }
}

/* ---------------- cliente HTTP contra el master ---------------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTextRequest {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionIdsResponse {
    pub text: String,
    pub section_ids: Vec<SectionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSectionsRequest {
    pub ids: Vec<SectionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSectionsResponse {
    pub contents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIdResponse {
    pub task_id: TaskId,
}

#[derive(Debug, Clone)]
pub struct HttpStore {
    client: Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn check(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("master devolvió status {status} en {url}: {body}");
        }
        Ok(resp)
    }

    /// Sube un texto al store del master (lo usa el loader del cliente).
    pub async fn upload_text(&self, name: &str, content: String) -> Result<TextInfo> {
        let url = format!("{}/api/v1/texts", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&UploadTextRequest {
                name: name.to_string(),
                content,
            })
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        Ok(Self::check(resp, &url).await?.json().await?)
    }
}

/// `{base}/api/v1/texts/{name}/sections` con el nombre como un único segmento
/// escapado (`/`, `?`, `#` y espacios incluidos).
fn sections_url(base_url: &str, text: &str) -> Result<Url> {
    let mut url = Url::parse(base_url).with_context(|| format!("MASTER_URL inválida: {base_url}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("MASTER_URL no admite rutas: {base_url}"))?
        .pop_if_empty()
        .extend(["api", "v1", "texts", text, "sections"]);
    Ok(url)
}

#[async_trait]
impl TextStore for HttpStore {
    async fn list_texts(&self) -> Result<Vec<TextInfo>> {
        let url = format!("{}/api/v1/texts", self.base_url);
        let resp = self.client.get(&url).send().await.with_context(|| format!("GET {url}"))?;
        Ok(Self::check(resp, &url).await?.json().await?)
    }

    async fn section_ids(&self, text: &str) -> Result<Vec<SectionId>> {
        let url = sections_url(&self.base_url, text)?;
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let body: SectionIdsResponse = Self::check(resp, url.as_str()).await?.json().await?;
        Ok(body.section_ids)
    }

    async fn fetch_sections(&self, ids: &[SectionId]) -> Result<Vec<String>> {
        let url = format!("{}/api/v1/sections/fetch", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&FetchSectionsRequest { ids: ids.to_vec() })
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        let body: FetchSectionsResponse = Self::check(resp, &url).await?.json().await?;
        Ok(body.contents)
    }

    async fn next_task_id(&self) -> Result<TaskId> {
        let url = format!("{}/api/v1/task-ids", self.base_url);
        let resp = self.client.post(&url).send().await.with_context(|| format!("POST {url}"))?;
        let body: TaskIdResponse = Self::check(resp, &url).await?.json().await?;
        Ok(body.task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("text_store_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn chunk_text_no_corta_caracteres_multibyte() {
        let content = "añoñoño"; // 'ñ' ocupa 2 bytes
        let chunks = chunk_text(content, 3);
        assert_eq!(chunks.concat(), content);
        for c in &chunks {
            assert!(c.len() <= 3);
        }
        assert_eq!(chunks, vec!["añ", "oñ", "oñ", "o"]);

        // carácter de 4 bytes con límite 2: va entero
        assert_eq!(chunk_text("🦀a", 2), vec!["🦀", "a"]);
        assert!(chunk_text("", 10).is_empty());
    }

    #[test]
    fn insert_y_fetch_ordenado_por_id() {
        let store = MemoryStore::default();
        store.insert_text("a", "0123456789", 4).unwrap();
        let info = store.insert_text("b", "abcdef", 4).unwrap();
        assert_eq!(info.sections, 2);

        let ids_a = store.ids_of("a").unwrap();
        assert_eq!(ids_a, vec![1, 2, 3]);
        assert_eq!(store.ids_of("b").unwrap(), vec![4, 5]);

        // pedidos desordenados vuelven en orden de id
        assert_eq!(
            store.sections(&[3, 1, 2]).unwrap(),
            vec!["0123", "4567", "89"]
        );

        let names: Vec<String> = store.texts().unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn errores_del_store() {
        let store = MemoryStore::default();
        store.insert_text("a", "hola", 1024).unwrap();

        let dup = store.insert_text("a", "otra", 1024).unwrap_err();
        assert_eq!(
            dup.downcast_ref::<StoreError>(),
            Some(&StoreError::TextExists("a".into()))
        );

        let missing = store.ids_of("zzz").unwrap_err();
        assert_eq!(
            missing.downcast_ref::<StoreError>(),
            Some(&StoreError::TextNotFound("zzz".into()))
        );

        let no_section = store.sections(&[1, 99]).unwrap_err();
        assert_eq!(
            no_section.downcast_ref::<StoreError>(),
            Some(&StoreError::MissingSection(99))
        );
    }

    #[test]
    fn task_sequence_persiste_entre_aperturas() {
        let dir = temp_dir("sequence");
        let path = dir.join("seq").join("task_seq");

        let seq = TaskSequence::open(path.clone()).unwrap();
        assert_eq!(seq.next().unwrap(), 1);
        assert_eq!(seq.next().unwrap(), 2);
        drop(seq);

        let reopened = TaskSequence::open(path).unwrap();
        assert_eq!(reopened.next().unwrap(), 3);
    }

    #[test]
    fn load_dir_lee_solo_txt_en_orden() {
        let dir = temp_dir("load");
        fs::write(dir.join("b.txt"), "segundo").unwrap();
        fs::write(dir.join("a.txt"), "primero texto").unwrap();
        fs::write(dir.join("notas.md"), "ignorar").unwrap();
        fs::write(dir.join("roto.txt"), [b'h', 0xff, b'i']).unwrap();

        let store = MemoryStore::default();
        let loaded = store.load_dir(&dir, 8).unwrap();
        let names: Vec<&str> = loaded.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "roto"]);
        assert_eq!(loaded[0].sections, 2);

        let roto = store.ids_of("roto").unwrap();
        assert_eq!(store.sections(&roto).unwrap(), vec!["h\u{FFFD}i"]);
    }

    #[test]
    fn nombre_de_texto_se_escapa_en_la_url() {
        let url = sections_url("http://master:8080", "a b?c/d#e").unwrap();
        assert_eq!(
            url.as_str(),
            "http://master:8080/api/v1/texts/a%20b%3Fc%2Fd%23e/sections"
        );

        let url = sections_url("http://master:8080/", "libro").unwrap();
        assert_eq!(url.as_str(), "http://master:8080/api/v1/texts/libro/sections");
    }
}
