//! Handwritten Diesel schema declarations matching `migrations/`.

diesel::table! {
    sample (id) {
        id -> BigInt,
        time -> Timestamptz,
        temp -> Double,
        pressure -> Nullable<Double>,
        location -> Nullable<Varchar>,
    }
}

diesel::table! {
    state (id) {
        id -> BigInt,
        time -> Timestamptz,
        set_point -> Double,
        set_point_enabled -> Bool,
        heat_on -> Bool,
        location -> Nullable<Varchar>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(sample, state);
