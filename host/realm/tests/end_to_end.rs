use tether_host::{
    capability::{CapabilityId, CapabilityMissing},
    config::RuntimeConfig,
    json,
    realm::promise::{self, PromiseState},
    runtime::GuestInstance,
    value::HostValue,
};

const HUD: &str = r#"
(module
  (import "./hud" "__wbg_newnoargs_f3005d02efe69623" (func $newnoargs (param i32 i32) (result i32)))
  (import "./hud" "__wbg_call_10738551fb4d99e4" (func $call (param i32 i32 i32) (result i32)))
  (import "./hud" "__widl_f_document_Window" (func $document (param i32) (result i32)))
  (import "./hud" "__widl_f_body_Document" (func $body (param i32) (result i32)))
  (import "./hud" "__widl_f_create_element_Document" (func $create_element (param i32 i32 i32 i32) (result i32)))
  (import "./hud" "__widl_f_set_inner_html_Element" (func $set_inner_html (param i32 i32 i32)))
  (import "./hud" "__widl_f_append_child_Node" (func $append_child (param i32 i32 i32) (result i32)))
  (import "./hud" "__wbg_new_6b7f4334f7b728fd" (func $new_object (result i32)))
  (import "./hud" "__wbindgen_string_new" (func $string_new (param i32 i32) (result i32)))
  (import "./hud" "__wbg_set_6f4fee47694f666d" (func $reflect_set (param i32 i32 i32 i32) (result i32)))
  (import "./hud" "__wbindgen_object_drop_ref" (func $drop_ref (param i32)))
  (import "./hud" "__widl_f_new_with_str_and_init_Request" (func $new_request (param i32 i32 i32 i32) (result i32)))
  (import "./hud" "__widl_f_fetch_with_request_Window" (func $fetch (param i32 i32) (result i32)))
  (import "./hud" "__widl_f_json_Response" (func $json (param i32 i32) (result i32)))
  (import "./hud" "__wbindgen_closure_wrapper1179" (func $closure_wrapper (param i32 i32 i32 i32 i32) (result i32)))
  (import "./hud" "__wbg_then_074a42f44879a676" (func $then (param i32 i32 i32) (result i32)))

  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))

  (func (export "__wbindgen_malloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap
      (i32.and
        (i32.add (i32.add (global.get $heap) (local.get $size)) (i32.const 7))
        (i32.const -8)))
    (local.get $ptr))

  (func (export "__wbindgen_global_argument_ptr") (result i32)
    (i32.const 512))

  (table (export "__indirect_function_table") 3 funcref)
  (elem (i32.const 1) $on_response $free_closure)

  ;; Exception slot at 256.
  (func $window (result i32)
    (call $call
      (call $newnoargs (i32.const 600) (i32.const 11))
      (i32.const 0)
      (i32.const 256)))

  (func (export "run") (result i32)
    (local $doc i32)
    (local $el i32)
    (local $obj i32)
    (local.set $doc (call $document (call $window)))
    (local.set $el
      (call $create_element (local.get $doc) (i32.const 660) (i32.const 1) (i32.const 256)))
    (call $set_inner_html (local.get $el) (i32.const 670) (i32.const 5))
    (drop (call $append_child (call $body (local.get $doc)) (local.get $el) (i32.const 256)))
    (call $drop_ref (local.get $el))
    (local.set $obj (call $new_object))
    (drop
      (call $reflect_set
        (local.get $obj)
        (call $string_new (i32.const 680) (i32.const 6))
        (call $string_new (i32.const 690) (i32.const 2))
        (i32.const 256)))
    (local.get $obj))

  (func (export "run_throwing") (result i32)
    (drop
      (call $create_element
        (call $document (call $window))
        (i32.const 700)
        (i32.const 2)
        (i32.const 256)))
    (if (result i32) (i32.eq (i32.load (i32.const 256)) (i32.const 1))
      (then (i32.load (i32.const 260)))
      (else (i32.const 0))))

  (func (export "run_fetch") (result i32)
    (local $request i32)
    (local.set $request
      (call $new_request (i32.const 640) (i32.const 8) (call $new_object) (i32.const 256)))
    (call $then
      (call $fetch (call $window) (local.get $request))
      (call $closure_wrapper (i32.const 7) (i32.const 9) (i32.const 1) (i32.const 2) (i32.const 0))
      (i32.const 0)))

  ;; Closure body: response => response.json()
  (func $on_response (param $a i32) (param $b i32) (param $response i32) (result i32)
    (call $json (local.get $response) (i32.const 256)))

  (func $free_closure (param $a i32) (param $b i32))

  (data (i32.const 600) "return this")
  (data (i32.const 640) "/sensors")
  (data (i32.const 660) "p")
  (data (i32.const 670) "hello")
  (data (i32.const 680) "answer")
  (data (i32.const 690) "42")
  (data (i32.const 700) "1x"))
"#;

fn instantiate(config: &RuntimeConfig) -> anyhow::Result<GuestInstance> {
    let engine = wasmtime::Engine::default();
    let module = wasmtime::Module::new(&engine, wat::parse_str(HUD)?)?;
    GuestInstance::instantiate(&engine, &module, config)
}

fn config(extra: &str) -> RuntimeConfig {
    RuntimeConfig::from_toml_str(extra).unwrap()
}

#[test]
fn guest_builds_dom_and_returns_an_object() {
    let mut guest = instantiate(&RuntimeConfig::default()).unwrap();
    let value = guest.run().unwrap();

    assert_eq!(json::stringify(&value).unwrap(), r#"{"answer":"42"}"#);
    assert_eq!(guest.realm().render_body(), "<body><p>hello</p></body>");
}

#[test]
fn thrown_errors_reach_the_guest_through_the_slot() {
    let mut guest = instantiate(&config("[exports]\nentry = \"run_throwing\"")).unwrap();
    let value = guest.run().unwrap();

    assert!(value.to_display_string().starts_with("InvalidCharacterError"));
}

#[test]
fn promise_chain_settles_after_the_entry_point_returns() {
    let mut guest = instantiate(&config(
        r#"
        [exports]
        entry = "run_fetch"

        [[fetch.routes]]
        url = "/sensors"
        body = '{ "temp": 21.5 }'
        "#,
    ))
    .unwrap();

    let value = guest.run().unwrap();

    let Some(PromiseState::Fulfilled(parsed)) = promise::state(&value) else {
        panic!("promise chain should have settled, got {value:?}");
    };
    assert_eq!(
        parsed.as_object().unwrap().get_str("temp"),
        Some(HostValue::Number(21.5))
    );
}

#[test]
fn failed_fetch_rejects_the_chain() {
    let mut guest = instantiate(&config(
        r#"
        [exports]
        entry = "run_fetch"

        [[fetch.routes]]
        url = "/sensors"
        unreachable = true
        "#,
    ))
    .unwrap();

    let value = guest.run().unwrap();

    let Some(PromiseState::Rejected(reason)) = promise::state(&value) else {
        panic!("promise chain should have rejected, got {value:?}");
    };
    assert!(reason.to_display_string().starts_with("TypeError"));
}

#[test]
fn missing_capability_refuses_to_instantiate() {
    let err = instantiate(&config(r#"disabled_capabilities = ["Reflect.set"]"#))
        .err()
        .expect("instantiation should fail");

    let missing = err.downcast_ref::<CapabilityMissing>().unwrap();
    assert_eq!(missing.capability, CapabilityId::ReflectSet);
    assert_eq!(missing.import, "__wbg_set_6f4fee47694f666d");
}

#[test]
fn unknown_imports_are_rejected() {
    let engine = wasmtime::Engine::default();
    let module = wasmtime::Module::new(
        &engine,
        wat::parse_str(r#"(module (import "./hud" "__widl_f_scroll_Window" (func (param i32))))"#)
            .unwrap(),
    )
    .unwrap();

    let err = GuestInstance::instantiate(&engine, &module, &RuntimeConfig::default())
        .err()
        .expect("instantiation should fail");

    assert!(err.to_string().contains("__widl_f_scroll_Window"));
}
