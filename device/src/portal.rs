pub const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Device Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:720px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:8px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}input[type=text],input[type=password]{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}progress{width:100%;margin-top:.6rem}
    dl{display:grid;grid-template-columns:9rem 1fr;gap:.2rem .6rem;margin:0}dt{color:#555}
  </style>
</head>
<body>
  <h1>Device Setup</h1>
  <div class="card">
    <h2>Network</h2>
    <dl>
      <dt>State</dt><dd id="netState">-</dd>
      <dt>WiFi</dt><dd id="netSsid">-</dd>
      <dt>Station IP</dt><dd id="netIp">-</dd>
      <dt>Gateway</dt><dd id="netGw">-</dd>
      <dt>Setup AP</dt><dd id="apInfo">-</dd>
      <dt>Device time</dt><dd id="devTime">-</dd>
    </dl>
  </div>
  <div class="card">
    <h2>WiFi Credentials</h2>
    <label>SSID</label><input id="ssid" type="text" maxlength="32">
    <label>Password</label><input id="password" type="password" maxlength="64">
    <button id="save">Save and Restart</button>
    <div id="wifiStatus" class="muted"></div>
  </div>
  <div class="card">
    <h2>Firmware Update</h2>
    <dl>
      <dt>Version</dt><dd id="fwVersion">-</dd>
      <dt>Running from</dt><dd id="fwPartition">-</dd>
      <dt>Next boot</dt><dd id="fwBoot">-</dd>
      <dt>Free space</dt><dd id="fwFree">-</dd>
      <dt>Last update</dt><dd id="fwLast">-</dd>
    </dl>
    <label>Firmware image (.bin)</label><input id="firmware" type="file" accept=".bin">
    <label>SHA256 (optional)</label><input id="sha" type="text" placeholder="64 hex chars">
    <button id="upload">Upload Firmware</button>
    <progress id="progress" max="100" value="0"></progress>
    <div id="otaStatus" class="muted"></div>
  </div>
  <script>
    const q=(id)=>document.getElementById(id);
    async function api(path,opt){const r=await fetch(path,opt);let b={};try{b=await r.json();}catch(_){}if(!r.ok)throw new Error(b.error||('Request failed: '+r.status));return b;}
    async function refresh(){
      const s=await api('/api/status');
      q('netState').textContent=s.state;
      q('netSsid').textContent=s.connected?(s.ssid||'-'):'not connected';
      q('netIp').textContent=s.ip?(s.ip+' / '+s.subnet):'-';
      q('netGw').textContent=s.gateway||'-';
      q('apInfo').textContent=s.apActive?(s.apSsid+' @ '+s.apIp+' ('+s.apPeers+' clients)'):'off';
      const t=await api('/api/time');
      q('devTime').textContent=t.synced?t.time:'Not synced';
      const o=await api('/api/ota/info');
      q('fwVersion').textContent=o.version;
      q('fwPartition').textContent=o.partition||'-';
      q('fwBoot').textContent=o.bootPartition||'-';
      q('fwFree').textContent=o.freeSpace!=null?(o.freeSpace+' bytes'):'-';
      q('fwLast').textContent=o.lastStatus?(o.lastStatus+(o.lastError?(': '+o.lastError):'')):'-';
    }
    q('save').addEventListener('click', async ()=>{
      q('wifiStatus').className='muted'; q('wifiStatus').textContent='Saving...';
      try{
        const payload={ssid:q('ssid').value.trim(),password:q('password').value};
        const res=await api('/api/wifi/save',{method:'POST',headers:{'content-type':'application/json'},body:JSON.stringify(payload)});
        q('wifiStatus').className='ok'; q('wifiStatus').textContent=res.message;
        q('password').value='';
      }catch(err){q('wifiStatus').className='err'; q('wifiStatus').textContent=err.message;}
    });
    q('upload').addEventListener('click', ()=>{
      const file=q('firmware').files[0];
      if(!file){q('otaStatus').className='err';q('otaStatus').textContent='Choose a firmware file first';return;}
      const xhr=new XMLHttpRequest();
      xhr.open('POST','/api/ota/update');
      xhr.setRequestHeader('content-type','application/octet-stream');
      const sha=q('sha').value.trim();
      if(sha) xhr.setRequestHeader('x-firmware-sha256',sha);
      xhr.upload.onprogress=(e)=>{if(e.lengthComputable)q('progress').value=Math.round(e.loaded*100/e.total);};
      xhr.onload=()=>{
        let b={};try{b=JSON.parse(xhr.responseText);}catch(_){}
        if(xhr.status===200){q('otaStatus').className='ok';q('otaStatus').textContent=b.message||'Update complete';}
        else{q('otaStatus').className='err';q('otaStatus').textContent=b.error||('Upload failed: '+xhr.status);}
        refresh().catch(()=>{});
      };
      xhr.onerror=()=>{q('otaStatus').className='err';q('otaStatus').textContent='Upload failed';};
      q('otaStatus').className='muted'; q('otaStatus').textContent='Uploading...';
      xhr.send(file);
    });
    refresh().catch((err)=>{q('wifiStatus').className='err';q('wifiStatus').textContent=err.message;});
    setInterval(()=>refresh().catch(()=>{}),5000);
  </script>
</body>
</html>
"#;
