//! Property tests over the negotiation engine's core guarantees.

use book_swap::{
    book::BookDetails,
    listing::ListingKind,
    notify::NullTransport,
    service::{AcceptOutcome, NegotiationService, SwapConfig},
    utils::new_uuid_to_bech32,
};
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::tempdir;

fn service(name: &str) -> (tempfile::TempDir, NegotiationService) {
    let dir = tempdir().unwrap();
    let db = Arc::new(sled::open(dir.path().join(name)).unwrap());
    let service = NegotiationService::new(db, Box::new(NullTransport), SwapConfig::default());
    (dir, service)
}

fn field() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z ]{0,30}[a-zA-Z]"
}

fn optional_field() -> impl Strategy<Value = Option<String>> {
    proptest::option::of(field())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The content address depends only on the field values; encoding the
    /// same details twice always yields the same hash and bytes.
    #[test]
    fn book_hashing_is_deterministic(
        title in field(),
        author in field(),
        genre in optional_field(),
        catalog_id in optional_field(),
    ) {
        let build = || {
            let mut book = BookDetails::new().set_title(&title).set_author(&author);
            if let Some(genre) = &genre {
                book = book.set_genre(genre);
            }
            if let Some(catalog_id) = &catalog_id {
                book = book.set_catalog_id(catalog_id);
            }
            book
        };

        let (hash_a, cbor_a) = build().validate_and_finalise().unwrap();
        let (hash_b, cbor_b) = build().validate_and_finalise().unwrap();
        prop_assert_eq!(&hash_a, &hash_b);
        prop_assert_eq!(cbor_a, cbor_b);

        // a different title moves the hash
        let (hash_c, _) = build()
            .set_title(&format!("{title} (2nd ed.)"))
            .validate_and_finalise()
            .unwrap();
        prop_assert_ne!(hash_a, hash_c);
    }
}

proptest! {
    // each case drives a full sled-backed engine, keep the count modest
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// No matter how many conversations compete and in which order the
    /// accepts land, exactly one wins and every loser's thread is voided.
    #[test]
    fn accepts_have_exactly_one_winner(
        order in Just((0..5usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let (_dir, service) = service("prop_one_winner.db");
        let owner = new_uuid_to_bech32("user_").unwrap();
        let listing = service
            .create_listing(
                &owner,
                &BookDetails::new().set_title("Solaris").set_author("Lem"),
                ListingKind::Gift,
            )
            .unwrap();

        let mut contenders = Vec::new();
        for _ in 0..order.len() {
            let user = new_uuid_to_bech32("user_").unwrap();
            let conv = service.open_conversation(&listing.id, &user).unwrap();
            service.propose(&conv.id, &owner, None).unwrap();
            contenders.push((conv.id, user));
        }

        let mut winners = 0;
        for index in order {
            let (conv_id, user) = &contenders[index];
            match service.accept(conv_id, user).unwrap() {
                AcceptOutcome::Reserved { listing, .. } => {
                    winners += 1;
                    prop_assert_eq!(
                        &listing.reservation().unwrap().conversation_id,
                        conv_id
                    );
                }
                AcceptOutcome::ListingGone { conversation } => {
                    prop_assert!(conversation.state.is_terminal());
                }
                AcceptOutcome::CounterListingGone { .. } => {
                    prop_assert!(false, "gift claims cannot lose a counter listing");
                }
            }
        }
        prop_assert_eq!(winners, 1);
    }

    /// Settling k extra times changes nothing: same returned state, same
    /// counters, same disposition.
    #[test]
    fn settlement_is_idempotent(extra_settles in 1usize..4) {
        let (_dir, service) = service("prop_idempotent.db");
        let owner = new_uuid_to_bech32("user_").unwrap();
        let guest = new_uuid_to_bech32("user_").unwrap();
        let listing = service
            .create_listing(
                &owner,
                &BookDetails::new().set_title("Solaris").set_author("Lem"),
                ListingKind::Gift,
            )
            .unwrap();
        let conv = service.open_conversation(&listing.id, &guest).unwrap();
        service.propose(&conv.id, &owner, None).unwrap();
        service.accept(&conv.id, &guest).unwrap();

        let (first_conv, first_listing) = service.complete(&conv.id, &owner).unwrap();
        for _ in 0..extra_settles {
            let (again_conv, again_listing) = service.complete(&conv.id, &guest).unwrap();
            prop_assert_eq!(&again_conv, &first_conv);
            prop_assert_eq!(&again_listing, &first_listing);
        }

        prop_assert_eq!(service.counters(&owner).unwrap().given, 1);
        prop_assert_eq!(service.counters(&guest).unwrap().received, 1);
    }

    /// Counter deltas follow the settled shape: gifts move given/received,
    /// exchanges move traded on both sides, a fallback moves only given.
    #[test]
    fn counter_deltas_match_the_outcome(kind_pick in 0u8..3) {
        let (_dir, service) = service("prop_counters.db");
        let owner = new_uuid_to_bech32("user_").unwrap();
        let guest = new_uuid_to_bech32("user_").unwrap();

        let (kind, requested) = match kind_pick {
            0 => (ListingKind::Gift, false),
            1 => (ListingKind::Exchange, true),
            _ => (ListingKind::Exchange, false), // gift fallback
        };

        let listing = service
            .create_listing(
                &owner,
                &BookDetails::new().set_title("Solaris").set_author("Lem"),
                kind,
            )
            .unwrap();
        let counter = if requested {
            let counter = service
                .create_listing(
                    &guest,
                    &BookDetails::new().set_title("Dune").set_author("Herbert"),
                    ListingKind::Exchange,
                )
                .unwrap();
            Some(counter.id)
        } else {
            None
        };

        let conv = service.open_conversation(&listing.id, &guest).unwrap();
        service
            .propose(&conv.id, &owner, counter.as_deref())
            .unwrap();
        service.accept(&conv.id, &guest).unwrap();
        service.complete(&conv.id, &guest).unwrap();

        let owner_counters = service.counters(&owner).unwrap();
        let guest_counters = service.counters(&guest).unwrap();
        match (kind, requested) {
            (ListingKind::Gift, _) => {
                prop_assert_eq!(owner_counters.given, 1);
                prop_assert_eq!(guest_counters.received, 1);
                prop_assert_eq!(owner_counters.traded + guest_counters.traded, 0);
            }
            (ListingKind::Exchange, true) => {
                prop_assert_eq!(owner_counters.traded, 1);
                prop_assert_eq!(guest_counters.traded, 1);
                prop_assert_eq!(owner_counters.given + guest_counters.received, 0);
            }
            (ListingKind::Exchange, false) => {
                prop_assert_eq!(owner_counters.given, 1);
                prop_assert_eq!(guest_counters.received, 0);
                prop_assert_eq!(owner_counters.traded + guest_counters.traded, 0);
            }
        }
    }
}
