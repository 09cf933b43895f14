//! Runs the shared counter-store contract suite against the in-memory store.

use shiftcap_testing::contract::counter_store_contract_tests;

counter_store_contract_tests! {
    suite = in_memory,
    make_store = shiftcap_memory::InMemoryCounterStore::new,
}
