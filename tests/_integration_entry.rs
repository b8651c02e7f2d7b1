// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::all)]

mod integration_tests {
    pub mod end_to_end;
}
