//! Sections backed by a JSON HTTP endpoint.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use url::Url;

use crate::db::SectionDataStore;
use crate::refresh::{fetch_all_pages, Page, SectionHandler};
use crate::status::{OwnerId, SectionId};

use super::client::CachedHttpClient;

/// Fetches a section from a URL and stores it in the section data table.
///
/// `{owner}` in the URL template is replaced with the owner id. Paged
/// endpoints are walked with a `page` query parameter and their items are
/// concatenated into one array.
pub struct HttpSection {
  section: SectionId,
  url_template: String,
  paged: bool,
  client: CachedHttpClient,
  store: SectionDataStore,
}

impl HttpSection {
  pub fn new(
    section: impl Into<SectionId>,
    url_template: impl Into<String>,
    client: CachedHttpClient,
    store: SectionDataStore,
  ) -> Self {
    Self {
      section: section.into(),
      url_template: url_template.into(),
      paged: false,
      client,
      store,
    }
  }

  pub fn paged(mut self, paged: bool) -> Self {
    self.paged = paged;
    self
  }

  fn url(&self, owner: OwnerId) -> String {
    self.url_template.replace("{owner}", &owner.0.to_string())
  }

  async fn fetch_pages(&self, url: &str) -> Result<Value> {
    let items = fetch_all_pages(|page| async move {
      let response = self.client.get_json(&page_url(url, page)?).await?;
      let items = match response.body {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
      };
      Ok::<_, color_eyre::Report>(Page {
        items,
        pages: response.pages,
      })
    })
    .await?;
    Ok(Value::Array(items))
  }
}

fn page_url(url: &str, page: u32) -> Result<String> {
  let mut url = Url::parse(url).map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
  url.query_pairs_mut().append_pair("page", &page.to_string());
  Ok(url.into())
}

impl SectionHandler for HttpSection {
  fn fetch(&self, owner: OwnerId) -> BoxFuture<'_, Result<Value>> {
    async move {
      let url = self.url(owner);
      if self.paged {
        self.fetch_pages(&url).await
      } else {
        Ok(self.client.get_json(&url).await?.body)
      }
    }
    .boxed()
  }

  fn persist(&self, owner: OwnerId, data: Value) -> BoxFuture<'_, Result<()>> {
    async move { self.store.upsert(owner, &self.section, &data) }.boxed()
  }

  fn fetch_kind(&self) -> &str {
    if self.client.is_offline() {
      "http-offline"
    } else {
      "http"
    }
  }
}
