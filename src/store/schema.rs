pub const SCHEMA: &str = r#"
-- Files table: one row per video on disk
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    filename TEXT NOT NULL,
    parent_folder TEXT,

    -- Probed video metadata (NULL until the metadata stage runs)
    duration_seconds REAL,
    width INTEGER,
    height INTEGER,
    fps REAL,
    codec TEXT,
    audio_tracks INTEGER,
    pix_fmt TEXT,
    color_space TEXT,
    color_transfer TEXT,
    color_primaries TEXT,

    -- Filesystem metadata
    file_size_bytes INTEGER,
    file_created_at TEXT,
    file_modified_at TEXT,

    tags TEXT,  -- JSON array of user tags

    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    indexed_at TEXT,   -- set when enrichment completes
    deleted_at TEXT    -- soft delete; purged by admin
);

CREATE INDEX IF NOT EXISTS idx_files_deleted ON files(deleted_at);
CREATE INDEX IF NOT EXISTS idx_files_indexed ON files(indexed_at);

-- Scenes: soft cuts within a file, dense 0-based index per file
CREATE TABLE IF NOT EXISTS scenes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    scene_index INTEGER NOT NULL,
    start_tc REAL NOT NULL,   -- seconds, inclusive
    end_tc REAL NOT NULL,     -- seconds, exclusive
    poster_frame_path TEXT,
    transcript TEXT,          -- NULL = not transcribed, '' = no speech
    face_scanned_at TEXT,     -- NULL until the face stage covered this scene
    clip_cluster_id INTEGER,
    clip_cluster_order REAL,
    UNIQUE(file_id, scene_index),
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_scenes_file ON scenes(file_id);
CREATE INDEX IF NOT EXISTS idx_scenes_cluster ON scenes(clip_cluster_id);

-- Faces: detected in a scene's poster, bbox in source-image pixels
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scene_id INTEGER NOT NULL,
    bbox_x REAL NOT NULL,
    bbox_y REAL NOT NULL,
    bbox_w REAL NOT NULL,
    bbox_h REAL NOT NULL,
    embedding BLOB NOT NULL,      -- float32 array stored as bytes
    embedding_dim INTEGER NOT NULL,
    cluster_id INTEGER,
    cluster_order REAL,
    FOREIGN KEY (scene_id) REFERENCES scenes(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_faces_scene ON faces(scene_id);
CREATE INDEX IF NOT EXISTS idx_faces_cluster ON faces(cluster_id);

-- Embeddings: one model-tagged vector per (scene, model)
CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scene_id INTEGER NOT NULL,
    model_name TEXT NOT NULL,
    model_version TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(scene_id, model_name),
    FOREIGN KEY (scene_id) REFERENCES scenes(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_name);

-- Enrichment queue: FIFO by queued_at, one job per file
CREATE TABLE IF NOT EXISTS enrichment_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'pending',  -- pending/processing/complete/failed
    queued_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    started_at TEXT,
    completed_at TEXT,
    error TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    current_stage TEXT,
    current_stage_num INTEGER,
    total_stages INTEGER,
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_queue_status ON enrichment_queue(status);

-- Runtime config: structured values keyed by name
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
