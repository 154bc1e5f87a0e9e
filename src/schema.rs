// Kept in sync with `migrations/` by hand.

diesel::table! {
    clients (id) {
        id -> Uuid,
        name -> Text,
        phone -> Text,
        phone_digits -> Text,
        email -> Text,
        cep -> Nullable<Text>,
        street -> Nullable<Text>,
        number -> Nullable<Text>,
        complement -> Nullable<Text>,
        district -> Nullable<Text>,
        city -> Nullable<Text>,
        state -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    braid_styles (id) {
        id -> Uuid,
        name -> Text,
        description -> Nullable<Text>,
        base_price -> Float8,
        estimated_duration -> Int4,
    }
}

diesel::table! {
    colors (id) {
        id -> Uuid,
        name -> Text,
        hex_code -> Text,
    }
}

diesel::table! {
    appointments (id) {
        id -> Uuid,
        date -> Date,
        time_period -> Text,
        status -> Text,
        notes -> Nullable<Text>,
        client_id -> Uuid,
        braid_style_id -> Uuid,
        color_id -> Uuid,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    finance_entries (id) {
        id -> Uuid,
        kind -> Text,
        amount -> Float8,
        description -> Text,
        date -> Date,
        category -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(appointments -> clients (client_id));
diesel::joinable!(appointments -> braid_styles (braid_style_id));
diesel::joinable!(appointments -> colors (color_id));

diesel::allow_tables_to_appear_in_same_query!(
    appointments,
    braid_styles,
    clients,
    colors,
    finance_entries,
);
