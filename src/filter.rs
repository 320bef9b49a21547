// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device filters: which external devices the driver mirrors.
//!
//! A filter contributes two things: the subscription patterns the backend
//! installs ([`DeviceFilter::topics`]) and a per-message accept test applied
//! to inbound traffic ([`DeviceFilter::match_topic`]). Subscriptions are
//! always per-device wildcards over the convention's shapes, never literal
//! per-control lists, so controls appearing after subscription are still
//! seen.

use std::collections::BTreeSet;

use crate::topic;

/// Selects the set of external devices the driver observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFilter {
    /// Mirror every device on the broker.
    AllDevices,
    /// Mirror nothing.
    NoDevices,
    /// Mirror exactly the listed device ids, all their controls.
    DeviceList(BTreeSet<String>),
}

impl DeviceFilter {
    /// Builds a list filter from device ids. Duplicates collapse.
    #[must_use]
    pub fn device_list<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::DeviceList(devices.into_iter().map(Into::into).collect())
    }

    /// Subscription patterns to install for this filter, covering control
    /// values, control meta, and device meta of every selected device.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        match self {
            Self::AllDevices => device_patterns("+").to_vec(),
            Self::NoDevices => Vec::new(),
            Self::DeviceList(devices) => devices
                .iter()
                .flat_map(|dev| device_patterns(dev))
                .collect(),
        }
    }

    /// Accept test for an inbound topic: `true` iff the topic matches one
    /// of this filter's subscription patterns.
    #[must_use]
    pub fn match_topic(&self, topic: &str) -> bool {
        self.topics()
            .iter()
            .any(|pattern| topic::matches(pattern, topic))
    }
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self::NoDevices
    }
}

fn device_patterns(device: &str) -> [String; 4] {
    [
        format!("{}/{device}/controls/+", topic::DEVICES_PREFIX),
        format!("{}/{device}/controls/+/meta/+", topic::DEVICES_PREFIX),
        format!("{}/{device}/meta/+", topic::DEVICES_PREFIX),
        format!("{}/{device}/meta", topic::DEVICES_PREFIX),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_devices_patterns() {
        let topics = DeviceFilter::AllDevices.topics();
        assert_eq!(
            topics,
            vec![
                "/devices/+/controls/+",
                "/devices/+/controls/+/meta/+",
                "/devices/+/meta/+",
                "/devices/+/meta",
            ]
        );
    }

    #[test]
    fn no_devices_subscribes_to_nothing() {
        assert!(DeviceFilter::NoDevices.topics().is_empty());
        assert!(!DeviceFilter::NoDevices.match_topic("/devices/d/controls/c"));
    }

    #[test]
    fn device_list_patterns_are_per_device_wildcards() {
        let filter = DeviceFilter::device_list(["dev1"]);
        let topics = filter.topics();
        // Wildcard over controls, never a literal per-control list.
        assert!(topics.contains(&"/devices/dev1/controls/+".to_string()));
        assert!(topics.contains(&"/devices/dev1/controls/+/meta/+".to_string()));
        assert!(topics.contains(&"/devices/dev1/meta/+".to_string()));
        assert!(topics.contains(&"/devices/dev1/meta".to_string()));
        assert_eq!(topics.len(), 4);
    }

    #[test]
    fn device_list_deduplicates() {
        let filter = DeviceFilter::device_list(["a", "b", "a"]);
        assert_eq!(filter.topics().len(), 8);
    }

    #[test]
    fn device_list_matches_only_listed_devices() {
        let filter = DeviceFilter::device_list(["dev1"]);
        assert!(filter.match_topic("/devices/dev1/controls/x"));
        assert!(filter.match_topic("/devices/dev1/controls/x/meta/type"));
        assert!(filter.match_topic("/devices/dev1/meta/driver"));
        assert!(!filter.match_topic("/devices/dev2/controls/x"));
        assert!(!filter.match_topic("/devices/dev1/controls/x/on"));
    }

    #[test]
    fn all_devices_matches_convention_topics_only() {
        let filter = DeviceFilter::AllDevices;
        assert!(filter.match_topic("/devices/any/controls/c"));
        assert!(filter.match_topic("/devices/any/meta"));
        assert!(!filter.match_topic("/other/any/controls/c"));
        assert!(!filter.match_topic("/devices/any/controls/c/on"));
    }
}
