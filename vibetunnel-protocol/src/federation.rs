// Copyright 2024 Google LLC
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

use serde_derive::{Deserialize, Serialize};

/// What the HQ knows about one remote node. The `sessionIds` ownership set
/// lives alongside this in the registry rather than on the wire type itself,
/// since it is mutated far more often than the identity fields are.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RemoteDescriptor {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub bearer_token: String,
}

/// `POST /api/remotes/register` request body.
#[derive(Deserialize, Debug, Clone)]
pub struct RegisterRemoteRequest {
    pub id: String,
    pub name: String,
    pub url: String,
    pub token: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct RegisterRemoteResponse {
    pub success: bool,
    pub remote: RemoteSummary,
}

/// The public view of a remote: no bearer token.
#[derive(Serialize, Debug, Clone)]
pub struct RemoteSummary {
    pub id: String,
    pub name: String,
    pub url: String,
    pub healthy: bool,
    #[serde(rename = "sessionCount")]
    pub session_count: usize,
}
