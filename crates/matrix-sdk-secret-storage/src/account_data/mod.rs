// Copyright 2023 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The account data collaborator.
//!
//! Secret storage keeps all of its state in per-account, per-type JSON
//! documents. How those documents are synchronized with a homeserver is up to
//! the implementor of the [`AccountDataStore`] trait, secret storage only
//! needs to read the local view of a document and to replace a document
//! wholesale.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

mod memory_store;

pub use memory_store::MemoryStore;

/// Error type for the account data store.
#[derive(Debug, Error)]
pub enum AccountDataError {
    /// A document couldn't be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// The store backend returned an error.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl AccountDataError {
    /// Create a new [`Backend`][Self::Backend] error.
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// A per-account store of JSON documents, keyed by their event type.
///
/// Reads consult an already materialized local view and are therefore
/// synchronous, writes may need to go over the network.
///
/// No ordering is guaranteed beyond "last successful write wins".
#[async_trait]
pub trait AccountDataStore: fmt::Debug + Send + Sync {
    /// Get the document with the given event type, `None` if there is no such
    /// document.
    fn get_account_data(&self, event_type: &str) -> Result<Option<Value>, AccountDataError>;

    /// Replace the document with the given event type.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The event type of the document.
    ///
    /// * `content` - The new content of the document.
    async fn set_account_data(&self, event_type: &str, content: Value)
        -> Result<(), AccountDataError>;
}

/// A type that can be type-erased into `Arc<dyn AccountDataStore>`.
///
/// This trait is not meant to be implemented directly outside
/// `matrix-sdk-secret-storage`, but it is automatically implemented for
/// everything that implements `AccountDataStore`.
pub trait IntoAccountDataStore {
    #[doc(hidden)]
    fn into_account_data_store(self) -> Arc<dyn AccountDataStore>;
}

impl<T> IntoAccountDataStore for T
where
    T: AccountDataStore + 'static,
{
    fn into_account_data_store(self) -> Arc<dyn AccountDataStore> {
        Arc::new(self)
    }
}

impl<T> IntoAccountDataStore for Arc<T>
where
    T: AccountDataStore + 'static,
{
    fn into_account_data_store(self) -> Arc<dyn AccountDataStore> {
        self
    }
}

impl IntoAccountDataStore for Arc<dyn AccountDataStore> {
    fn into_account_data_store(self) -> Arc<dyn AccountDataStore> {
        self
    }
}
