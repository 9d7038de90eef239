//! Domain entities and their remote document mappings.
//!
//! Remote field names are camelCase; the local serde representation is the
//! Rust field names and is only ever read back by this crate.

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cache::{fold_term, Weighted};
use crate::remote::{bool_field, i64_field, str_field, string_list, u64_field, Document};

/// The signed-in user the engine acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
  pub uid: String,
  pub display_name: Option<String>,
  pub email: Option<String>,
}

impl Session {
  pub fn new(uid: impl Into<String>) -> Self {
    Self {
      uid: uid.into(),
      display_name: None,
      email: None,
    }
  }
}

fn object(value: Value) -> Document {
  match value {
    Value::Object(map) => map,
    _ => Document::new(),
  }
}

fn now_millis() -> i64 {
  Utc::now().timestamp_millis()
}

// ============================================================================
// Profile
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
  pub id: String,
  pub title: String,
  pub description: String,
  pub skills: Vec<String>,
  pub img_url: Option<String>,
  /// Milliseconds since the epoch
  pub created_at: Option<i64>,
  pub created_by_id: Option<String>,
}

impl Project {
  fn to_value(&self) -> Value {
    json!({
      "id": self.id,
      "title": self.title,
      "description": self.description,
      "skills": self.skills,
      "imgUrl": self.img_url,
      "createdAt": self.created_at,
      "createdById": self.created_by_id,
    })
  }

  fn from_fields(fields: &Document) -> Self {
    Self {
      id: str_field(fields, "id").unwrap_or_default(),
      title: str_field(fields, "title").unwrap_or_default(),
      description: str_field(fields, "description").unwrap_or_default(),
      skills: string_list(fields, "skills").unwrap_or_default(),
      img_url: str_field(fields, "imgUrl"),
      created_at: i64_field(fields, "createdAt"),
      created_by_id: str_field(fields, "createdById"),
    }
  }
}

/// A project the user is creating, with an optional cover image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewProject {
  pub title: String,
  pub description: String,
  pub skills: Vec<String>,
  pub image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
  pub id: String,
  pub name: String,
  pub email: String,
  pub linkedin: Option<String>,
  pub phone: Option<String>,
  pub bio: Option<String>,
  pub tags: Vec<String>,
  pub projects: Vec<Project>,
  /// Public URL of the uploaded avatar
  pub avatar_url: Option<String>,
  pub projects_updated_at: Option<i64>,
}

impl Profile {
  /// Base profile built from what the session knows.
  pub fn new_default(session: &Session) -> Self {
    Self {
      id: session.uid.clone(),
      name: session.display_name.clone().unwrap_or_default(),
      email: session.email.clone().unwrap_or_default(),
      ..Self::default()
    }
  }

  pub fn to_document(&self) -> Document {
    let projects: Vec<Value> = self.projects.iter().map(Project::to_value).collect();

    let mut document = object(json!({
      "id": self.id,
      "displayName": self.name,
      "email": self.email,
      "linkedin": self.linkedin,
      "phone": self.phone,
      "bio": self.bio,
      "tags": self.tags,
      "projects": projects,
      "avatarUrl": self.avatar_url,
      "projectsUpdatedAt": self.projects_updated_at,
    }));
    // Written by the server; never clear it from here
    if self.projects_updated_at.is_none() {
      document.remove("projectsUpdatedAt");
    }
    document
  }

  pub fn from_document(id: &str, doc: &Document) -> Self {
    let projects = doc
      .get("projects")
      .and_then(Value::as_array)
      .map(|items| {
        items
          .iter()
          .filter_map(Value::as_object)
          .map(Project::from_fields)
          .collect()
      })
      .unwrap_or_default();

    Self {
      id: str_field(doc, "id").unwrap_or_else(|| id.to_string()),
      // Older documents store `name` instead of `displayName`
      name: str_field(doc, "displayName")
        .or_else(|| str_field(doc, "name"))
        .unwrap_or_default(),
      email: str_field(doc, "email").unwrap_or_default(),
      linkedin: str_field(doc, "linkedin"),
      phone: str_field(doc, "phone"),
      bio: str_field(doc, "bio"),
      tags: string_list(doc, "tags").unwrap_or_default(),
      projects,
      avatar_url: str_field(doc, "avatarUrl"),
      projects_updated_at: i64_field(doc, "projectsUpdatedAt"),
    }
  }

  pub fn apply(&mut self, delta: &ProfileDelta) {
    if let Some(name) = &delta.name {
      self.name = name.clone();
    }
    if let Some(linkedin) = &delta.linkedin {
      self.linkedin = Some(linkedin.clone());
    }
    if let Some(phone) = &delta.phone {
      self.phone = Some(phone.clone());
    }
    if let Some(bio) = &delta.bio {
      self.bio = Some(bio.clone());
    }
    if let Some(tags) = &delta.tags {
      self.tags = tags.clone();
    }
    if let Some(avatar_url) = &delta.avatar_url {
      self.avatar_url = Some(avatar_url.clone());
    }
    if let Some(projects) = &delta.projects {
      self.projects = projects.clone();
    }
  }

  pub fn has_avatar(&self) -> bool {
    self.avatar_url.as_deref().is_some_and(|url| !url.is_empty())
  }
}

/// Changed profile fields; `None` means unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileDelta {
  pub name: Option<String>,
  pub linkedin: Option<String>,
  pub phone: Option<String>,
  pub bio: Option<String>,
  pub tags: Option<Vec<String>>,
  pub avatar_url: Option<String>,
  /// The whole project list, replaced at once
  pub projects: Option<Vec<Project>>,
}

impl ProfileDelta {
  pub fn to_document(&self) -> Document {
    let mut fields = Document::new();
    if let Some(name) = &self.name {
      fields.insert("displayName".into(), json!(name));
    }
    if let Some(linkedin) = &self.linkedin {
      fields.insert("linkedin".into(), json!(linkedin));
    }
    if let Some(phone) = &self.phone {
      fields.insert("phone".into(), json!(phone));
    }
    if let Some(bio) = &self.bio {
      fields.insert("bio".into(), json!(bio));
    }
    if let Some(tags) = &self.tags {
      fields.insert("tags".into(), json!(tags));
    }
    if let Some(avatar_url) = &self.avatar_url {
      fields.insert("avatarUrl".into(), json!(avatar_url));
    }
    if let Some(projects) = &self.projects {
      let projects: Vec<Value> = projects.iter().map(Project::to_value).collect();
      fields.insert("projects".into(), Value::Array(projects));
    }
    fields
  }

  pub fn is_empty(&self) -> bool {
    self.to_document().is_empty()
  }
}

// ============================================================================
// Collections (portfolio items, résumés)
// ============================================================================

/// A freshly uploaded blob, described for its remote document.
pub struct UploadedBlob<'a, M> {
  pub uid: &'a str,
  pub file_name: &'a str,
  pub url: &'a str,
  pub storage_path: &'a str,
  pub bytes: u64,
  pub meta: &'a M,
}

/// Entities kept as a per-user list under `users/<uid>/<COLLECTION>`, each
/// backed by an uploaded file.
pub trait CollectionEntity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Sparse field change
  type Delta: Clone + Send + Sync + Serialize + DeserializeOwned + 'static;
  /// Caller-supplied upload metadata (title, language)
  type Meta: Clone + Send + Sync + Serialize + DeserializeOwned + 'static;

  /// Local namespace for snapshots, queues and staged files
  const KIND: &'static str;
  const COLLECTION: &'static str;

  fn id(&self) -> &str;

  fn storage_path(&self) -> Option<&str>;

  fn apply(&mut self, delta: &Self::Delta);

  fn delta_fields(delta: &Self::Delta) -> Document;

  fn from_document(id: &str, doc: &Document) -> Option<Self>;

  fn default_file_name(meta: &Self::Meta) -> String;

  fn blob_path(uid: &str, file_name: &str, meta: &Self::Meta) -> String;

  fn upload_fields(upload: &UploadedBlob<'_, Self::Meta>) -> Document;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioItem {
  pub id: String,
  pub title: String,
  pub file_name: String,
  pub url: String,
  pub storage_path: Option<String>,
  pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioDelta {
  pub title: Option<String>,
}

impl CollectionEntity for PortfolioItem {
  type Delta = PortfolioDelta;
  type Meta = String;

  const KIND: &'static str = "portfolio";
  const COLLECTION: &'static str = "portfolios";

  fn id(&self) -> &str {
    &self.id
  }

  fn storage_path(&self) -> Option<&str> {
    self.storage_path.as_deref()
  }

  fn apply(&mut self, delta: &PortfolioDelta) {
    if let Some(title) = &delta.title {
      self.title = title.clone();
    }
  }

  fn delta_fields(delta: &PortfolioDelta) -> Document {
    let mut fields = Document::new();
    if let Some(title) = &delta.title {
      fields.insert("title".into(), json!(title));
    }
    fields
  }

  fn from_document(id: &str, doc: &Document) -> Option<Self> {
    Some(Self {
      id: id.to_string(),
      title: str_field(doc, "title").unwrap_or_default(),
      file_name: str_field(doc, "fileName").unwrap_or_default(),
      url: str_field(doc, "url")?,
      storage_path: str_field(doc, "storagePath"),
      bytes: u64_field(doc, "bytes").unwrap_or_default(),
    })
  }

  fn default_file_name(_title: &String) -> String {
    format!("portfolio_{}.pdf", uuid::Uuid::new_v4())
  }

  fn blob_path(uid: &str, file_name: &str, _title: &String) -> String {
    format!("portfolios/{}/{}", uid, file_name)
  }

  fn upload_fields(upload: &UploadedBlob<'_, String>) -> Document {
    object(json!({
      "userId": upload.uid,
      "fileName": upload.file_name,
      "title": upload.meta,
      "url": upload.url,
      "storagePath": upload.storage_path,
      "bytes": upload.bytes,
      "contentType": "application/pdf",
      "uploadedAt": now_millis(),
    }))
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResumeLanguage {
  #[default]
  Es,
  En,
}

impl ResumeLanguage {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResumeLanguage::Es => "ES",
      ResumeLanguage::En => "EN",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.trim().to_uppercase().as_str() {
      "ES" => Some(ResumeLanguage::Es),
      "EN" => Some(ResumeLanguage::En),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resume {
  pub id: String,
  pub file_name: String,
  pub url: String,
  pub storage_path: Option<String>,
  pub language: ResumeLanguage,
  pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeDelta {
  pub file_name: Option<String>,
  pub language: Option<ResumeLanguage>,
}

impl CollectionEntity for Resume {
  type Delta = ResumeDelta;
  type Meta = ResumeLanguage;

  const KIND: &'static str = "resume";
  const COLLECTION: &'static str = "resumes";

  fn id(&self) -> &str {
    &self.id
  }

  fn storage_path(&self) -> Option<&str> {
    self.storage_path.as_deref()
  }

  fn apply(&mut self, delta: &ResumeDelta) {
    if let Some(file_name) = &delta.file_name {
      self.file_name = file_name.clone();
    }
    if let Some(language) = delta.language {
      self.language = language;
    }
  }

  fn delta_fields(delta: &ResumeDelta) -> Document {
    let mut fields = Document::new();
    if let Some(file_name) = &delta.file_name {
      fields.insert("fileName".into(), json!(file_name));
    }
    if let Some(language) = delta.language {
      fields.insert("language".into(), json!(language.as_str()));
    }
    fields
  }

  fn from_document(id: &str, doc: &Document) -> Option<Self> {
    Some(Self {
      id: id.to_string(),
      file_name: str_field(doc, "fileName").unwrap_or_default(),
      url: str_field(doc, "url")?,
      storage_path: str_field(doc, "storagePath"),
      language: str_field(doc, "language")
        .and_then(|l| ResumeLanguage::parse(&l))
        .unwrap_or_default(),
      bytes: u64_field(doc, "bytes").unwrap_or_default(),
    })
  }

  fn default_file_name(language: &ResumeLanguage) -> String {
    format!(
      "cv_{}_{}.pdf",
      language.as_str().to_lowercase(),
      uuid::Uuid::new_v4()
    )
  }

  fn blob_path(uid: &str, file_name: &str, language: &ResumeLanguage) -> String {
    format!("resumes/{}/{}/{}", uid, language.as_str(), file_name)
  }

  fn upload_fields(upload: &UploadedBlob<'_, ResumeLanguage>) -> Document {
    object(json!({
      "userId": upload.uid,
      "fileName": upload.file_name,
      "url": upload.url,
      "storagePath": upload.storage_path,
      "language": upload.meta.as_str(),
      "bytes": upload.bytes,
      "contentType": "application/pdf",
      "uploadedAt": now_millis(),
    }))
  }
}

// ============================================================================
// Contact requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRequest {
  pub id: String,
  pub from_uid: String,
  pub from_name: Option<String>,
  pub from_email: Option<String>,
  pub to_uid: String,
  pub to_name: Option<String>,
  pub to_email: Option<String>,
  pub reviewed: bool,
  /// Milliseconds since the epoch
  pub contact_request_time: i64,
  pub review_time: Option<i64>,
}

impl ContactRequest {
  /// `None` if the document lacks either party.
  pub fn from_document(id: &str, doc: &Document) -> Option<Self> {
    Some(Self {
      id: id.to_string(),
      from_uid: str_field(doc, "fromUid")?,
      from_name: str_field(doc, "fromName"),
      from_email: str_field(doc, "fromEmail"),
      to_uid: str_field(doc, "toUid")?,
      to_name: str_field(doc, "toName"),
      to_email: str_field(doc, "toEmail"),
      reviewed: bool_field(doc, "reviewed").unwrap_or(false),
      contact_request_time: i64_field(doc, "contactRequestTime")
        .or_else(|| i64_field(doc, "timestamp"))
        .unwrap_or_else(now_millis),
      review_time: i64_field(doc, "reviewTime"),
    })
  }
}

/// A user's received and sent contact requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactInbox {
  pub received: Vec<ContactRequest>,
  pub sent: Vec<ContactRequest>,
}

impl ContactInbox {
  /// Mark a received request reviewed. Returns whether it was found.
  pub fn mark_reviewed(&mut self, request_id: &str, review_time: i64) -> bool {
    match self.received.iter_mut().find(|r| r.id == request_id) {
      Some(request) => {
        request.reviewed = true;
        request.review_time = Some(review_time);
        true
      }
      None => false,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDelta {
  pub review_time: i64,
}

impl ReviewDelta {
  pub fn to_document(&self) -> Document {
    object(json!({
      "reviewed": true,
      "reviewTime": self.review_time,
    }))
  }
}

// ============================================================================
// Project applications
// ============================================================================

/// The signed-in user's application to someone's project. Kept in the
/// `applications` array of the applicant's user document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectApplication {
  pub project_id: String,
  pub created_by_id: String,
  pub project_title: String,
}

impl ProjectApplication {
  pub fn to_value(&self, applied_at: i64) -> Value {
    json!({
      "projectId": self.project_id,
      "createdById": self.created_by_id,
      "appliedAt": applied_at,
    })
  }

  /// Project ids in a user document's `applications` array.
  pub fn applied_ids(doc: &Document) -> Vec<String> {
    doc
      .get("applications")
      .and_then(Value::as_array)
      .map(|items| {
        items
          .iter()
          .filter_map(Value::as_object)
          .filter_map(|item| str_field(item, "projectId"))
          .collect()
      })
      .unwrap_or_default()
  }
}

// ============================================================================
// Directory and search
// ============================================================================

/// Display name and avatar of another user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
  pub display_name: Option<String>,
  pub avatar_url: Option<String>,
}

impl ProfileSummary {
  pub fn from_document(doc: &Document) -> Self {
    Self {
      display_name: str_field(doc, "displayName"),
      avatar_url: str_field(doc, "avatarUrl"),
    }
  }
}

/// A public user as listed in search results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserCard {
  pub id: String,
  pub display_name: String,
  pub headline: String,
  pub photo_url: String,
  pub location: String,
  /// Folded skill terms, comparable with query terms
  pub skills: Vec<String>,
  pub is_public: bool,
}

impl UserCard {
  pub fn from_document(id: &str, doc: &Document) -> Self {
    let skills = string_list(doc, "skillsOrTopics")
      .or_else(|| string_list(doc, "habilidades"))
      .unwrap_or_default()
      .iter()
      .map(|s| fold_term(s))
      .collect();

    Self {
      id: id.to_string(),
      display_name: str_field(doc, "displayName").unwrap_or_default(),
      headline: str_field(doc, "headline").unwrap_or_default(),
      photo_url: str_field(doc, "photoUrl").unwrap_or_default(),
      location: str_field(doc, "location").unwrap_or_default(),
      skills,
      is_public: bool_field(doc, "isPublic") == Some(true),
    }
  }
}

/// One cached page of search results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
  pub users: Vec<UserCard>,
  pub fetched_at: chrono::DateTime<Utc>,
}

impl Weighted for SearchPage {
  fn units(&self) -> usize {
    self.users.len()
  }
}
