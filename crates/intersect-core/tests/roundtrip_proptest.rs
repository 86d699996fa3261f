// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests for the wire contract round trips.

use intersect_core::{
    ContentType, DataHandler, Hierarchy, UserspaceMessage, UserspaceMessageOptions,
};
use proptest::prelude::*;

fn label() -> impl Strategy<Value = String> {
    "[a-z0-9][a-z0-9-]{0,11}"
}

fn hierarchy() -> impl Strategy<Value = Hierarchy> {
    (label(), label(), label(), proptest::option::of(label()), label()).prop_map(
        |(organization, facility, system, subsystem, service)| {
            Hierarchy::new(organization, facility, system, subsystem, service).unwrap()
        },
    )
}

proptest! {
    #[test]
    fn hierarchy_name_round_trips(h in hierarchy()) {
        let parsed = Hierarchy::parse(&h.name()).unwrap();
        prop_assert_eq!(parsed, h);
    }

    #[test]
    fn topic_prefix_always_has_five_segments(h in hierarchy()) {
        prop_assert_eq!(h.topic_prefix().split('/').count(), 5);
    }

    #[test]
    fn userspace_round_trips_text(payload in "\\PC{0,64}") {
        let msg = UserspaceMessage::create(
            "org.fac.sys.svc",
            "org.fac.sys.sub.svc",
            "Cap.op",
            payload.clone().into_bytes(),
            UserspaceMessageOptions {
                content_type: ContentType::Text,
                ..Default::default()
            },
        );
        let back = UserspaceMessage::deserialize_and_validate(&msg.serialize().unwrap()).unwrap();
        prop_assert_eq!(back.payload, payload.into_bytes());
        prop_assert_eq!(back.headers.source, msg.headers.source);
        prop_assert_eq!(back.headers.destination, msg.headers.destination);
    }

    #[test]
    fn userspace_round_trips_binary(payload in proptest::collection::vec(any::<u8>(), 0..256)) {
        let msg = UserspaceMessage::create(
            "org.fac.sys.svc",
            "org.fac.sys.sub.svc",
            "Cap.op",
            payload.clone(),
            UserspaceMessageOptions {
                content_type: ContentType::Binary,
                data_handler: DataHandler::Message,
                ..Default::default()
            },
        );
        let back = UserspaceMessage::deserialize_and_validate(&msg.serialize().unwrap()).unwrap();
        prop_assert_eq!(back.payload, payload);
    }
}
