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

use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use serde_json::Value;

use super::{AccountDataError, AccountDataStore};

/// An in-memory only account data store, all documents are forgotten once
/// it's dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// The event types of all the documents in the store.
    pub fn event_types(&self) -> Vec<String> {
        self.documents.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }
}

#[async_trait]
impl AccountDataStore for MemoryStore {
    fn get_account_data(&self, event_type: &str) -> Result<Option<Value>, AccountDataError> {
        Ok(self.documents.read().unwrap_or_else(PoisonError::into_inner).get(event_type).cloned())
    }

    async fn set_account_data(
        &self,
        event_type: &str,
        content: Value,
    ) -> Result<(), AccountDataError> {
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_type.to_owned(), content);

        Ok(())
    }
}
