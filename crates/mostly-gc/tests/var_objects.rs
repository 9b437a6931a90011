//! Variable-size objects and arrays: elements bigger than a page live in
//! dedicated page groups and are promoted in place, never copied.

use mostly_gc::{
    alloc_array, alloc_var_object, collect, GcArray, GcPtr, Traverse, PAGE_BYTES,
};

const ARRAYS: usize = 100;
const ELEMS: usize = 8;

#[derive(Traverse)]
struct Payload {
    value1: i64,
    value2: i64,
}

#[test]
fn oversized_var_elements_survive_repeated_collections() {
    let mut arrays: [GcPtr<GcArray<GcPtr<Payload>>>; ARRAYS] = [GcPtr::null(); ARRAYS];

    for (k, slot) in arrays.iter_mut().enumerate() {
        let mut array = alloc_array::<GcPtr<Payload>>(ELEMS);
        for e in 0..ELEMS {
            let sentinel = (k * ELEMS + e) as i64;
            array[e] = alloc_var_object(
                Payload {
                    value1: sentinel,
                    value2: sentinel,
                },
                PAGE_BYTES + 2,
            );
        }
        *slot = array;
        collect();
    }

    for (k, array) in arrays.iter().enumerate() {
        assert_eq!(array.len(), ELEMS);
        for e in 0..ELEMS {
            let payload = array[e];
            let sentinel = (k * ELEMS + e) as i64;
            assert_eq!(payload.value1, sentinel, "array {k} element {e} damaged");
            assert_eq!(payload.value1, payload.value2);
        }
    }
}
