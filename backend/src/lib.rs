// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

#![deny(unreachable_pub)]

pub mod backend_service;
pub mod connector;
pub mod errors;
pub mod event_log;
pub mod files;
pub mod idempotency;
pub mod identity_service;
pub mod ingress;
pub mod live;
pub mod message_store;
pub mod router;
pub mod settings;
pub mod status_propagator;
