//! Esquema Diesel (escrito a mano). Reemplazable con `diesel print-schema`.

diesel::table! {
    session_drafts (id) {
        id -> Uuid,
        principal_id -> Text,
        estimate_id -> Text,
        data -> Jsonb,
        current_step -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        save_reason -> Text,
        version -> Int8,
        checksum -> Text,
    }
}
